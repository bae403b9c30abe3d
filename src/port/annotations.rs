//! Annotation-driven preferred ports.
//!
//! Workloads may carry a `kfwd.io/port-forward` annotation naming the ports
//! an operator most likely wants to forward:
//!
//! ```text
//! kfwd.io/port-forward: "http::8080"            # port named http, local 8080
//! kfwd.io/port-forward: "web:9000"              # container web, port 9000
//! kfwd.io/port-forward: "http::8080,admin"      # several ports
//! ```
//!
//! Each entry is `[container:]name-or-number[::local]`. Names win over
//! numbers when both could match.

use std::collections::BTreeMap;

use serde::Serialize;

use super::spec::{ContainerPortSpecs, PortSpec};
use crate::error::ForwardError;

/// Annotation key carrying preferred port-forwards.
pub const PORT_FORWARD_KEY: &str = "kfwd.io/port-forward";

/// Opaque workload metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations(BTreeMap<String, String>);

/// A preferred port resolved against the container's specs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortDraft {
    pub remote: PortSpec,
    pub local: Option<u16>,
}

impl PortDraft {
    /// Local port suggestion, mirroring the remote port when unset.
    pub fn local_or_remote(&self) -> u16 {
        self.local.unwrap_or(self.remote.port)
    }
}

/// Preferred ports in annotation order. Empty means "no opinion".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PreferredPorts(Vec<PortDraft>);

struct PortAnnotation<'a> {
    container: Option<&'a str>,
    port: &'a str,
    local: Option<&'a str>,
}

fn parse_entry(entry: &str) -> Result<PortAnnotation<'_>, ForwardError> {
    let (head, local) = match entry.split_once("::") {
        Some((h, l)) => (h, Some(l.trim())),
        None => (entry, None),
    };
    let (container, port) = match head.split_once(':') {
        Some((c, p)) => (Some(c.trim()), p.trim()),
        None => (None, head.trim()),
    };
    if port.is_empty() || container.is_some_and(str::is_empty) {
        return Err(ForwardError::Resolution(format!(
            "malformed port annotation entry {entry:?}"
        )));
    }

    Ok(PortAnnotation {
        container,
        port,
        local,
    })
}

fn resolve_entry(
    entry: &PortAnnotation<'_>,
    specs: &ContainerPortSpecs,
) -> Result<PortDraft, ForwardError> {
    if let (Some(want), Some(have)) = (entry.container, specs.container()) {
        if want != have {
            return Err(ForwardError::Resolution(format!(
                "port {:?} is annotated for container {want:?}, not {have:?}",
                entry.port
            )));
        }
    }
    let remote = specs.lookup(entry.port).ok_or_else(|| {
        ForwardError::Resolution(format!("no container port matches {:?}", entry.port))
    })?;
    let local = match entry.local {
        Some(l) => Some(
            l.parse::<u16>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ForwardError::Resolution(format!("invalid local port {l:?}")))?,
        ),
        None => None,
    };

    Ok(PortDraft {
        remote: remote.clone(),
        local,
    })
}

impl Annotations {
    pub fn new(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Resolve the preferred-port annotation against `specs`.
    ///
    /// A missing annotation yields an empty result. Any entry that cannot
    /// be resolved fails the whole lookup; callers warn and fall back to
    /// manual entry.
    pub fn preferred_ports(&self, specs: &ContainerPortSpecs) -> Result<PreferredPorts, ForwardError> {
        let Some(value) = self.get(PORT_FORWARD_KEY) else {
            return Ok(PreferredPorts::default());
        };
        if specs.is_empty() {
            return Err(ForwardError::Resolution(
                "container exposes no forwardable ports".to_string(),
            ));
        }

        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| parse_entry(s).and_then(|e| resolve_entry(&e, specs)))
            .collect::<Result<Vec<_>, _>>()
            .map(PreferredPorts)
    }
}

impl From<BTreeMap<String, String>> for Annotations {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Annotations {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn descriptor(spec: &PortSpec, total: usize) -> String {
    if total > 1 {
        format!("{}::{}", spec.label(), spec.port)
    } else {
        spec.port.to_string()
    }
}

impl PreferredPorts {
    pub fn new(drafts: Vec<PortDraft>) -> Self {
        Self(drafts)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PortDraft> {
        self.0.iter()
    }

    /// Pre-filled `(container port, local port)` dialog fields.
    ///
    /// With no preference the first declared port is suggested. The remote
    /// field is disambiguated as `name::port` when the container exposes
    /// more than one port; several preferences are rendered as bare
    /// comma-separated lists.
    pub fn to_port_spec(&self, specs: &ContainerPortSpecs) -> (String, String) {
        match self.0.as_slice() {
            [] => specs.first().map_or_else(
                || (String::new(), String::new()),
                |first| (descriptor(first, specs.len()), first.port.to_string()),
            ),
            [one] => (
                descriptor(&one.remote, specs.len()),
                one.local_or_remote().to_string(),
            ),
            many => (
                join(many.iter().map(|d| d.remote.port)),
                join(many.iter().map(PortDraft::local_or_remote)),
            ),
        }
    }
}

fn join(ports: impl Iterator<Item = u16>) -> String {
    ports.map(|p| p.to_string()).collect::<Vec<_>>().join(",")
}
