//! Host name under which published container ports are reachable

use crate::error::{Error, Result};
use reqwest::Url;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::debug;

const DOCKERENV: &str = "/.dockerenv";
const ROUTE_TABLE: &str = "/proc/net/route";

/// Derive the host name for published ports from the daemon address.
///
/// An explicit override wins. TCP daemons are reached under their own host
/// name. Socket daemons publish on the local machine, except when the caller
/// itself runs in a container: then the ports are on the default gateway.
pub fn resolve_daemon_host(daemon_url: &str, host_override: Option<&str>) -> Result<String> {
    resolve_with(
        daemon_url,
        host_override,
        Path::new(DOCKERENV),
        Path::new(ROUTE_TABLE),
    )
}

pub(crate) fn resolve_with(
    daemon_url: &str,
    host_override: Option<&str>,
    dockerenv: &Path,
    route_table: &Path,
) -> Result<String> {
    if let Some(host) = host_override {
        return Ok(host.to_string());
    }

    let url = Url::parse(daemon_url).map_err(|e| {
        Error::Configuration(format!("invalid daemon address '{}': {}", daemon_url, e))
    })?;

    match url.scheme() {
        "http" | "https" | "tcp" => url.host_str().map(str::to_string).ok_or_else(|| {
            Error::Configuration(format!("daemon address '{}' has no host", daemon_url))
        }),
        "unix" | "npipe" => {
            if !dockerenv.exists() {
                return Ok("localhost".to_string());
            }
            let routes = std::fs::read_to_string(route_table).map_err(|e| {
                Error::Configuration(format!(
                    "running in a container but cannot read {}: {}",
                    route_table.display(),
                    e
                ))
            })?;
            let gateway = parse_default_gateway(&routes).ok_or_else(|| {
                Error::Configuration(
                    "running in a container but found no default gateway".to_string(),
                )
            })?;
            debug!(gateway = %gateway, "Reaching containers through the default gateway");
            Ok(gateway.to_string())
        }
        other => Err(Error::Configuration(format!(
            "unsupported daemon address scheme '{}'",
            other
        ))),
    }
}

/// Gateway of the default route in the `/proc/net/route` format
pub fn parse_default_gateway(route_table: &str) -> Option<Ipv4Addr> {
    route_table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [_iface, "00000000", gateway, ..] => {
                let raw = u32::from_str_radix(gateway, 16).ok()?;
                // stored in host byte order, i.e. little endian
                Some(Ipv4Addr::from(raw.to_le_bytes()))
            }
            _ => None,
        }
    })
}
