//! Operator port text → validated tunnel specs.
//!
//! Field grammar:
//!
//! ```text
//! remote  := PORT ("," PORT)* | NAME "::" PORT
//! local   := PORT ("," PORT)*          # same cardinality as remote
//! address := free-form host or IP, empty = configured default
//! ```
//!
//! Parsing is all-or-nothing and never touches the forwarder registry.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, TcpListener};

use serde::Serialize;

use super::spec::ContainerPortSpecs;
use crate::error::ForwardError;

/// One resolved forwarding intent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TunnelSpec {
    pub remote_port: u16,
    pub local_port: u16,
    pub address: String,
}

impl TunnelSpec {
    pub fn new(address: &str, local_port: u16, remote_port: u16) -> Self {
        Self {
            remote_port,
            local_port,
            address: address.to_string(),
        }
    }

    /// Host/port pair the local listener binds.
    pub fn local_endpoint(&self) -> (&str, u16) {
        (self.address.as_str(), self.local_port)
    }

    /// Whether both specs would listen on the same local socket. Hosts are
    /// compared as addresses where possible (`localhost` is loopback) and a
    /// wildcard address clashes with every host of its family.
    pub fn clashes_with(&self, other: &TunnelSpec) -> bool {
        if self.local_port != other.local_port {
            return false;
        }
        match (host_ip(&self.address), host_ip(&other.address)) {
            (Some(a), Some(b)) => {
                a == b || (a.is_ipv4() == b.is_ipv4() && (a.is_unspecified() || b.is_unspecified()))
            }
            _ => self.address.trim().eq_ignore_ascii_case(other.address.trim()),
        }
    }
}

fn host_ip(host: &str) -> Option<IpAddr> {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    host.parse().ok()
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> {}", self.address, self.local_port, self.remote_port)
    }
}

/// Tunnel specs produced by one parse, in pairing order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PortTunnels(Vec<TunnelSpec>);

impl PortTunnels {
    pub fn new(specs: Vec<TunnelSpec>) -> Self {
        Self(specs)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TunnelSpec> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[TunnelSpec] {
        &self.0
    }

    /// Probe every local endpoint by binding and releasing it.
    pub fn check_available(&self) -> Result<(), ForwardError> {
        for spec in &self.0 {
            TcpListener::bind(spec.local_endpoint()).map_err(|source| ForwardError::Bind {
                spec: spec.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a PortTunnels {
    type Item = &'a TunnelSpec;
    type IntoIter = std::slice::Iter<'a, TunnelSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for PortTunnels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(", "))
    }
}

fn is_numeric_list(s: &str) -> bool {
    s.split(',').all(|t| {
        let t = t.trim();
        !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit())
    })
}

/// Check the remote field against what the container declares.
///
/// Every remote port must be a declared port. In `NAME::PORT` form, `NAME`
/// must be the port's name or its container's name.
pub fn check_remote(remote: &str, specs: &ContainerPortSpecs) -> Result<(), ForwardError> {
    let remote = remote.trim();
    let (ports, _) = parse_remote(remote)?;
    let label = remote
        .rsplit_once("::")
        .map(|(head, _)| head.trim())
        .filter(|head| !head.bytes().all(|b| b.is_ascii_digit()));

    for port in ports {
        let spec = specs.find_by_port(port).ok_or_else(|| {
            ForwardError::Validation(format!("container does not declare port {port}"))
        })?;
        if let Some(label) = label {
            if spec.name.as_deref() != Some(label) && spec.container != label {
                return Err(ForwardError::Validation(format!(
                    "port {port} is not named {label:?}"
                )));
            }
        }
    }
    Ok(())
}

/// Local-port auto-fill for the remote field.
///
/// `name::port` suggests whatever follows the last `::`; a bare port list
/// is mirrored as-is; anything else suggests nothing.
pub fn extract_port(remote: &str) -> String {
    let remote = remote.trim();
    if let Some((_, tail)) = remote.rsplit_once("::") {
        return tail.trim().to_string();
    }
    if is_numeric_list(remote) {
        return remote.to_string();
    }
    String::new()
}

fn parse_port(token: &str, field: &str) -> Result<u16, ForwardError> {
    let token = token.trim();
    token
        .parse::<u16>()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| ForwardError::Validation(format!("invalid {field} port {token:?}")))
}

/// Remote ports and, for `A::B` forms, the local candidate.
fn parse_remote(remote: &str) -> Result<(Vec<u16>, Option<u16>), ForwardError> {
    if let Some((head, tail)) = remote.rsplit_once("::") {
        let head = head.trim();
        if head.is_empty() || head.contains(',') {
            return Err(ForwardError::Validation(format!(
                "invalid container port {remote:?}"
            )));
        }
        let tail = parse_port(tail, "container")?;
        // "80::8080" is remote::local; "nginx::80" is name::remote.
        return Ok(if head.bytes().all(|b| b.is_ascii_digit()) {
            (vec![parse_port(head, "container")?], Some(tail))
        } else {
            (vec![tail], None)
        });
    }

    if !is_numeric_list(remote) {
        return Err(ForwardError::Validation(format!(
            "container ports must be numeric, got {remote:?}"
        )));
    }
    let ports = remote
        .split(',')
        .map(|t| parse_port(t, "container"))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((ports, None))
}

/// Turn the dialog fields into tunnel specs.
///
/// An empty `local` field is auto-filled from the remote field before
/// validation; an empty `address` falls back to `default_address`.
pub fn parse(
    address: &str,
    remote: &str,
    local: &str,
    default_address: &str,
) -> Result<PortTunnels, ForwardError> {
    let remote = remote.trim();
    if remote.is_empty() {
        return Err(ForwardError::Validation(
            "container to local port mismatch".to_string(),
        ));
    }
    let (remote_ports, local_candidate) = parse_remote(remote)?;

    let local = local.trim();
    let local_ports: Vec<u16> = if local.is_empty() {
        match local_candidate {
            Some(p) => vec![p],
            None => {
                let filled = extract_port(remote);
                if filled.is_empty() {
                    return Err(ForwardError::Validation(
                        "container to local port mismatch".to_string(),
                    ));
                }
                filled
                    .split(',')
                    .map(|t| parse_port(t, "local"))
                    .collect::<Result<_, _>>()?
            }
        }
    } else {
        local
            .split(',')
            .map(|t| parse_port(t, "local"))
            .collect::<Result<_, _>>()?
    };

    if local_ports.len() != remote_ports.len() {
        return Err(ForwardError::Validation(format!(
            "container to local port mismatch ({} container vs {} local)",
            remote_ports.len(),
            local_ports.len()
        )));
    }

    let address = match address.trim() {
        "" => default_address,
        a => a,
    };

    Ok(PortTunnels(
        remote_ports
            .into_iter()
            .zip(local_ports)
            .map(|(r, l)| TunnelSpec::new(address, l, r))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortSpec;

    fn web_specs() -> ContainerPortSpecs {
        ContainerPortSpecs::new(vec![
            PortSpec::new("web", Some("http"), 80),
            PortSpec::new("web", None, 9000),
        ])
    }

    #[test]
    fn test_check_remote_accepts_declared_ports() {
        let specs = web_specs();
        check_remote("http::80", &specs).unwrap();
        check_remote("web::9000", &specs).unwrap();
        check_remote("80,9000", &specs).unwrap();
        check_remote("80::8080", &specs).unwrap();
    }

    #[test]
    fn test_check_remote_rejects_undeclared_port() {
        let err = check_remote("9999", &web_specs()).unwrap_err();
        assert!(matches!(err, ForwardError::Validation(_)));
        assert!(err.to_string().contains("9999"));
        assert!(check_remote("80,81", &web_specs()).is_err());
    }

    #[test]
    fn test_check_remote_rejects_wrong_name() {
        let err = check_remote("bogus::80", &web_specs()).unwrap_err();
        assert!(matches!(err, ForwardError::Validation(_)));
        assert!(err.to_string().contains("bogus"));
        // Unnamed port only answers to its container.
        assert!(check_remote("http::9000", &web_specs()).is_err());
    }

    #[test]
    fn test_localhost_and_loopback_clash() {
        let a = TunnelSpec::new("localhost", 8080, 80);
        assert!(a.clashes_with(&TunnelSpec::new("127.0.0.1", 8080, 81)));
        assert!(a.clashes_with(&TunnelSpec::new("0.0.0.0", 8080, 81)));
        assert!(!a.clashes_with(&TunnelSpec::new("127.0.0.1", 8081, 80)));
        assert!(!a.clashes_with(&TunnelSpec::new("::1", 8080, 80)));
        assert!(TunnelSpec::new("::", 8080, 80).clashes_with(&TunnelSpec::new("[::1]", 8080, 80)));
    }

    fn pairs(tt: &PortTunnels) -> Vec<(u16, u16)> {
        tt.iter().map(|t| (t.remote_port, t.local_port)).collect()
    }

    #[test]
    fn test_parse_list_preserves_pairing_order() {
        let tt = parse("", "8080,9090", "8080,9090", "localhost").unwrap();
        assert_eq!(pairs(&tt), vec![(8080, 8080), (9090, 9090)]);
        assert!(tt.iter().all(|t| t.address == "localhost"));
    }

    #[test]
    fn test_parse_remote_local_pair_with_default_address() {
        let tt = parse("", "80::8080", "", "localhost").unwrap();
        assert_eq!(tt.as_slice(), &[TunnelSpec::new("localhost", 8080, 80)]);
    }

    #[test]
    fn test_parse_named_container_port() {
        let tt = parse("0.0.0.0", "nginx::80", "", "localhost").unwrap();
        assert_eq!(tt.as_slice(), &[TunnelSpec::new("0.0.0.0", 80, 80)]);

        let tt = parse("", "http::80", "18080", "localhost").unwrap();
        assert_eq!(pairs(&tt), vec![(80, 18080)]);
    }

    #[test]
    fn test_parse_rejects_non_numeric_token_in_list() {
        let err = parse("", "8080,http", "8080,80", "localhost").unwrap_err();
        assert!(matches!(err, ForwardError::Validation(_)));
    }

    #[test]
    fn test_parse_rejects_cardinality_mismatch() {
        let err = parse("", "8080,9090", "8080", "localhost").unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn test_parse_rejects_empty_remote() {
        assert!(parse("", "  ", "8080", "localhost").is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_ports() {
        assert!(parse("", "0", "80", "localhost").is_err());
        assert!(parse("", "80", "65536", "localhost").is_err());
        assert!(parse("", "web::", "", "localhost").is_err());
    }

    #[test]
    fn test_parse_mirrors_bare_list_into_empty_local() {
        let tt = parse("", "80, 443", "", "127.0.0.1").unwrap();
        assert_eq!(pairs(&tt), vec![(80, 80), (443, 443)]);
    }

    #[test]
    fn test_extract_port() {
        assert_eq!(extract_port("nginx::80"), "80");
        assert_eq!(extract_port("a::b::9000"), "9000");
        assert_eq!(extract_port("8080,9090"), "8080,9090");
        assert_eq!(extract_port("nginx"), "");
        assert_eq!(extract_port(""), "");
    }

    #[test]
    fn test_check_available_reports_bound_port() {
        let held = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let tt = PortTunnels::new(vec![TunnelSpec::new("127.0.0.1", port, 80)]);
        let err = tt.check_available().unwrap_err();
        assert!(matches!(err, ForwardError::Bind { .. }));
    }
}
