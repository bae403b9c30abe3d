//! Port discovery, preferred-port resolution and tunnel spec parsing.
//!
//! Everything in this module is pure: no I/O beyond the optional local
//! availability probe, no shared state.

pub mod annotations;
pub mod spec;
pub mod tunnel;

pub use annotations::{Annotations, PortDraft, PreferredPorts, PORT_FORWARD_KEY};
pub use spec::{resolve, ContainerPortSpecs, PortSpec};
pub use tunnel::{check_remote, extract_port, parse, PortTunnels, TunnelSpec};
