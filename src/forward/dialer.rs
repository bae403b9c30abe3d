//! Transport seam between a local tunnel and the pod it reaches.
//!
//! [`PortDialer::connect`] opens one duplex byte stream to a container port
//! for every accepted local connection. [`PortDialer::terminated`] resolves
//! once the target can no longer be reached at all (pod deleted, container
//! stopped); the registry uses it to evict forwarders that died underneath.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::ForwarderKey;
use crate::workload::{check_running_status, split_path};

/// Byte stream carried by a tunnel connection.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

pub type BoxedStream = Box<dyn TunnelStream>;

#[async_trait]
pub trait PortDialer: Send + Sync {
    /// Open a stream to `remote_port` inside the target container.
    async fn connect(&self, key: &ForwarderKey, remote_port: u16) -> io::Result<BoxedStream>;

    /// Resolve with a reason once the target is gone for good.
    async fn terminated(&self, key: &ForwarderKey) -> String;
}

/// Dialer using the API server's pod port-forward subresource.
#[derive(Clone)]
pub struct KubeDialer {
    client: Client,
    namespace: String,
    probe_interval: Duration,
}

impl KubeDialer {
    pub fn new(client: Client, namespace: &str, probe_interval: Duration) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            probe_interval,
        }
    }

    fn pods(&self, key: &ForwarderKey) -> (Api<Pod>, String) {
        let (ns, name) = split_path(&key.path, &self.namespace);
        (Api::namespaced(self.client.clone(), ns), name.to_string())
    }
}

#[async_trait]
impl PortDialer for KubeDialer {
    async fn connect(&self, key: &ForwarderKey, remote_port: u16) -> io::Result<BoxedStream> {
        let (pods, name) = self.pods(key);
        let mut forwarder = pods
            .portforward(&name, &[remote_port])
            .await
            .map_err(io::Error::other)?;
        let stream = forwarder.take_stream(remote_port).ok_or_else(|| {
            io::Error::other(format!("no stream for port {remote_port} on {key}"))
        })?;

        // The forwarder drives the websocket; it finishes once the stream
        // is dropped on either side.
        let key = key.clone();
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                debug!(key = %key, remote_port, "port-forward session ended: {e}");
            }
        });

        Ok(Box::new(stream))
    }

    async fn terminated(&self, key: &ForwarderKey) -> String {
        let (pods, name) = self.pods(key);
        let mut interval = tokio::time::interval(self.probe_interval);
        loop {
            interval.tick().await;
            match pods.get_opt(&name).await {
                Ok(None) => return format!("pod {} deleted", key.path),
                Ok(Some(pod)) => {
                    let statuses = pod
                        .status
                        .as_ref()
                        .and_then(|s| s.container_statuses.as_deref())
                        .unwrap_or_default();
                    if let Err(e) = check_running_status(&key.container, statuses) {
                        return e.to_string();
                    }
                }
                // API hiccups are not proof the target is gone.
                Err(e) => warn!(key = %key, "liveness probe failed: {e}"),
            }
        }
    }
}
