//! Workload accessors consumed by the port-forward flow.
//!
//! The resource cache is an external collaborator; this module only needs
//! a read-only pod snapshot by path (`namespace/name`). [`Forwardable`] is
//! the capability a workload kind implements to take part in forwarding.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, ContainerState, ContainerStatus, Pod};
use kube::{Api, Client};
use tracing::debug;

use crate::error::ForwardError;
use crate::port::{self, Annotations, ContainerPortSpecs};

/// Split `namespace/name`, using `default_ns` for bare names.
pub fn split_path<'a>(path: &'a str, default_ns: &'a str) -> (&'a str, &'a str) {
    match path.split_once('/') {
        Some((ns, name)) => (ns, name),
        None => (default_ns, path),
    }
}

/// Human-readable container state.
pub fn container_state(state: Option<&ContainerState>) -> &'static str {
    match state {
        Some(s) if s.running.is_some() => "Running",
        Some(s) if s.waiting.is_some() => "Waiting",
        Some(s) if s.terminated.is_some() => "Terminated",
        _ => "Unknown",
    }
}

pub fn locate_container<'a>(name: &str, containers: &'a [Container]) -> Result<&'a Container, ForwardError> {
    containers
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| ForwardError::Workload(format!("unable to locate container named {name:?}")))
}

/// A container that is waiting or terminated has no socket to forward to.
pub fn check_running_status(name: &str, statuses: &[ContainerStatus]) -> Result<(), ForwardError> {
    let cs = statuses
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| ForwardError::Workload(format!("unable to locate container status for {name:?}")))?;

    match container_state(cs.state.as_ref()) {
        "Running" => Ok(()),
        state => Err(ForwardError::Workload(format!(
            "container {name} is not running ({state})"
        ))),
    }
}

/// Capability of a workload kind whose instances can be port-forwarded.
pub trait Forwardable {
    /// Forwardable ports of `container`. Fails when the container is
    /// missing or not running.
    fn forwardable_ports(&self, container: &str) -> Result<ContainerPortSpecs, ForwardError>;

    fn port_annotations(&self) -> Annotations;
}

impl Forwardable for Pod {
    fn forwardable_ports(&self, container: &str) -> Result<ContainerPortSpecs, ForwardError> {
        let containers = self.spec.as_ref().map_or(&[][..], |s| s.containers.as_slice());
        locate_container(container, containers)?;
        let statuses = self
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_deref())
            .unwrap_or_default();
        check_running_status(container, statuses)?;

        Ok(port::resolve(container, containers))
    }

    fn port_annotations(&self) -> Annotations {
        self.metadata.annotations.clone().unwrap_or_default().into()
    }
}

/// Read-only access to workload instances.
#[async_trait]
pub trait WorkloadSource: Send + Sync {
    async fn fetch_pod(&self, path: &str) -> Result<Pod, ForwardError>;
}

/// [`WorkloadSource`] backed by the cluster API.
#[derive(Clone)]
pub struct KubeWorkloads {
    client: Client,
    namespace: String,
}

impl KubeWorkloads {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl WorkloadSource for KubeWorkloads {
    async fn fetch_pod(&self, path: &str) -> Result<Pod, ForwardError> {
        let (ns, name) = split_path(path, &self.namespace);
        debug!(ns, name, "fetching pod");
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        pods.get_opt(name)
            .await?
            .ok_or_else(|| ForwardError::Workload(format!("pod {ns}/{name} not found")))
    }
}

/// Fetch `path` and collect what `container` can forward plus the pod's
/// annotations.
pub async fn list_forwardable(
    source: &dyn WorkloadSource,
    path: &str,
    container: &str,
) -> Result<(ContainerPortSpecs, Annotations), ForwardError> {
    let pod = source.fetch_pod(path).await?;
    let ports = pod.forwardable_ports(container)?;

    Ok((ports, pod.port_annotations()))
}
