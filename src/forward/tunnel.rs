//! A single live tunnel: one local listener forwarding into one container
//! port.
//!
//! Binding happens up front in [`Tunnel::bind`] so that the registry can
//! report bind failures synchronously. [`Tunnel::run`] then accepts local
//! connections until cancelled, dialing the remote port once per
//! connection and copying bytes both ways.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dialer::PortDialer;
use super::ForwarderKey;
use crate::error::ForwardError;
use crate::port::TunnelSpec;

/// How a tunnel (or the forwarder's liveness monitor) ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelExit {
    /// Cancelled by the registry.
    Closed,
    /// The tunnel died on its own.
    Failed(String),
}

/// A bound, not yet running tunnel.
pub struct Tunnel {
    spec: TunnelSpec,
    listener: TcpListener,
}

impl Tunnel {
    pub async fn bind(spec: &TunnelSpec) -> Result<Self, ForwardError> {
        let listener = TcpListener::bind(spec.local_endpoint())
            .await
            .map_err(|source| ForwardError::Bind {
                spec: spec.clone(),
                source,
            })?;

        Ok(Self {
            spec: spec.clone(),
            listener,
        })
    }

    /// Accept loop. Returns once `cancel` fires or the listener breaks.
    /// Open connections are torn down before returning.
    pub async fn run(
        self,
        key: ForwarderKey,
        dialer: Arc<dyn PortDialer>,
        cancel: CancellationToken,
    ) -> TunnelExit {
        let mut conns = JoinSet::new();
        info!(key = %key, tunnel = %self.spec, "tunnel listening");

        let exit = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break TunnelExit::Closed,
                accepted = self.listener.accept() => match accepted {
                    Ok((sock, peer)) => {
                        conns.spawn(serve(
                            sock,
                            peer,
                            key.clone(),
                            self.spec.remote_port,
                            Arc::clone(&dialer),
                            cancel.clone(),
                        ));
                    }
                    Err(e) => break TunnelExit::Failed(format!("accept on {} failed: {e}", self.spec)),
                },
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
            }
        };

        let open = conns.len();
        conns.shutdown().await;
        debug!(key = %key, tunnel = %self.spec, open, "tunnel stopped");
        exit
    }
}

async fn serve(
    mut local: TcpStream,
    peer: SocketAddr,
    key: ForwarderKey,
    remote_port: u16,
    dialer: Arc<dyn PortDialer>,
    cancel: CancellationToken,
) {
    let mut remote = match dialer.connect(&key, remote_port).await {
        Ok(s) => s,
        Err(e) => {
            warn!(key = %key, %peer, remote_port, "unable to reach container port: {e}");
            return;
        }
    };

    tokio::select! {
        () = cancel.cancelled() => {}
        res = tokio::io::copy_bidirectional(&mut local, &mut remote) => match res {
            Ok((up, down)) => debug!(key = %key, %peer, up, down, "connection closed"),
            Err(e) => debug!(key = %key, %peer, "connection error: {e}"),
        },
    }
}
