//! Forwardable port discovery.
//!
//! A [`ContainerPortSpecs`] is derived only from what a container declares;
//! nothing here invents ports or looks at runtime state. The running-state
//! guard lives with the workload accessors in [`crate::workload`].

use std::fmt;

use k8s_openapi::api::core::v1::{Container, ContainerPort};
use serde::Serialize;

/// Port-forwarding only carries TCP.
const TCP: &str = "TCP";

/// One forwardable port of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortSpec {
    pub container: String,
    pub name: Option<String>,
    pub protocol: String,
    pub port: u16,
}

impl PortSpec {
    pub fn new(container: &str, name: Option<&str>, port: u16) -> Self {
        Self {
            container: container.to_string(),
            name: name.map(ToString::to_string),
            protocol: TCP.to_string(),
            port,
        }
    }

    /// Label used to disambiguate the port in the remote-port field: the
    /// port name when declared, otherwise the owning container.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.container)
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(
                f,
                "{}::{}:{}/{}",
                self.container, name, self.port, self.protocol
            ),
            None => write!(f, "{}::{}/{}", self.container, self.port, self.protocol),
        }
    }
}

/// Ordered forwardable ports of one container, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ContainerPortSpecs(Vec<PortSpec>);

impl ContainerPortSpecs {
    pub fn new(specs: Vec<PortSpec>) -> Self {
        Self(specs)
    }

    /// Convert declared container ports, keeping valid TCP ports only.
    pub fn from_container_ports(container: &str, ports: &[ContainerPort]) -> Self {
        let specs = ports
            .iter()
            .filter(|p| p.protocol.as_deref().unwrap_or(TCP).eq_ignore_ascii_case(TCP))
            .filter_map(|p| {
                let port = u16::try_from(p.container_port).ok().filter(|n| *n > 0)?;
                Some(PortSpec::new(container, p.name.as_deref(), port))
            })
            .collect();
        Self(specs)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&PortSpec> {
        self.0.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PortSpec> {
        self.0.iter()
    }

    /// Container the specs belong to (all specs share one).
    pub fn container(&self) -> Option<&str> {
        self.0.first().map(|s| s.container.as_str())
    }

    pub fn find_by_name(&self, name: &str) -> Option<&PortSpec> {
        self.0.iter().find(|s| s.name.as_deref() == Some(name))
    }

    pub fn find_by_port(&self, port: u16) -> Option<&PortSpec> {
        self.0.iter().find(|s| s.port == port)
    }

    /// Name match first, then numeric match.
    pub fn lookup(&self, name_or_number: &str) -> Option<&PortSpec> {
        self.find_by_name(name_or_number).or_else(|| {
            name_or_number
                .parse::<u16>()
                .ok()
                .and_then(|n| self.find_by_port(n))
        })
    }
}

impl<'a> IntoIterator for &'a ContainerPortSpecs {
    type Item = &'a PortSpec;
    type IntoIter = std::slice::Iter<'a, PortSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for ContainerPortSpecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for spec in &self.0 {
            writeln!(f, "  {spec}")?;
        }
        Ok(())
    }
}

/// Forwardable ports of `container` among the supplied containers.
///
/// An unknown container is a lookup miss: the result is empty and callers
/// treat it as "nothing forwardable".
pub fn resolve(container: &str, containers: &[Container]) -> ContainerPortSpecs {
    containers
        .iter()
        .find(|c| c.name == container)
        .map(|c| ContainerPortSpecs::from_container_ports(container, c.ports.as_deref().unwrap_or_default()))
        .unwrap_or_default()
}
