// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Probe target expansion: every endpoint is duplicated once per probe path.
//!
//! The per-path record key is `<endpointId>@<pathId>`; the implicit default
//! path keeps the bare endpoint id so single-path configs stay readable.

use crate::config::{Config, Endpoint, ProbePath};
use crate::probe::netmon::interface_ips;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// Path id used when the config declares no probe paths.
pub const DEFAULT_PATH_ID: &str = "default";

/// One `(path, endpoint)` probe assignment.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    /// Endpoint with its id already suffixed for non-default paths.
    pub endpoint: Endpoint,
    pub path_id: String,
    pub bind_iface: Option<String>,
    pub bind_ip: Option<IpAddr>,
}

/// Local addresses a path may bind to, resolved once per path.
#[derive(Debug, Clone)]
enum PathBinding {
    None,
    Fixed(IpAddr),
    Interface(Vec<IpAddr>),
}

/// Expand `paths x endpoints` into probe targets.
///
/// A path whose binding cannot be resolved is dropped whole (with a log
/// line); the remaining paths are unaffected.
#[must_use]
pub fn expand_targets(cfg: &Config) -> Vec<ProbeTarget> {
    let paths: Vec<ProbePath> = if cfg.probe_paths.is_empty() {
        vec![ProbePath {
            id: DEFAULT_PATH_ID.to_string(),
            bind_interface: None,
            bind_ip: None,
        }]
    } else {
        cfg.probe_paths.clone()
    };

    let mut out = Vec::new();
    for path in paths {
        let binding = match resolve_binding(&path) {
            Ok(binding) => binding,
            Err(msg) => {
                log::error!("[probe] path {} disabled: {}", path.id, msg);
                continue;
            }
        };
        for ep in &cfg.endpoints {
            let mut endpoint = ep.clone();
            if path.id != DEFAULT_PATH_ID {
                endpoint.id = format!("{}@{}", endpoint.id, path.id);
            }
            let bind_ip = choose_bind_ip(&binding, &endpoint.host, endpoint.port);
            out.push(ProbeTarget {
                endpoint,
                path_id: path.id.clone(),
                bind_iface: path.bind_interface.clone(),
                bind_ip,
            });
        }
    }
    out
}

fn resolve_binding(path: &ProbePath) -> Result<PathBinding, String> {
    if let Some(ip_str) = &path.bind_ip {
        let ip = ip_str
            .parse::<IpAddr>()
            .map_err(|_| format!("invalid bindIp {:?}", ip_str))?;
        return Ok(PathBinding::Fixed(ip));
    }
    if let Some(iface) = &path.bind_interface {
        let ips = interface_ips(iface).map_err(|e| format!("interface {}: {}", iface, e))?;
        if ips.is_empty() {
            return Err(format!("no addresses on interface {}", iface));
        }
        return Ok(PathBinding::Interface(ips));
    }
    Ok(PathBinding::None)
}

/// For interface bindings, pick the address whose family matches what the
/// destination resolves to (v4 wins when both are offered).
fn choose_bind_ip(binding: &PathBinding, host: &str, port: u16) -> Option<IpAddr> {
    let ips = match binding {
        PathBinding::None => return None,
        PathBinding::Fixed(ip) => return Some(*ip),
        PathBinding::Interface(ips) => ips,
    };

    let mut dest_v4 = false;
    let mut dest_v6 = false;
    if let Ok(addrs) = (host, port).to_socket_addrs() {
        for addr in addrs {
            match addr {
                SocketAddr::V4(_) => dest_v4 = true,
                SocketAddr::V6(_) => dest_v6 = true,
            }
        }
    }
    if dest_v4 {
        if let Some(ip) = ips.iter().find(|ip| ip.is_ipv4()) {
            return Some(*ip);
        }
    }
    if dest_v6 {
        if let Some(ip) = ips.iter().find(|ip| ip.is_ipv6()) {
            return Some(*ip);
        }
    }
    ips.first().copied()
}
