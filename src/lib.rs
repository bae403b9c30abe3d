#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! kfwd library: the port-forward core of a cluster console.
//!
//! - `port`: container port specs, annotation preferences, dialog parsing
//! - `forward`: the forwarder registry, tunnels and the dialer seam
//! - `workload`: pod lookup and the `Forwardable` capability
//! - `config`: configuration loading
//! - `error`: the shared error taxonomy

pub mod config;
pub mod error;
pub mod forward;
pub mod port;
pub mod workload;

pub use error::ForwardError;
pub use forward::{ForwardEvent, ForwardHooks, ForwarderKey, ForwarderView, Forwarders};
