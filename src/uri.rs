//! Endpoint bootstrap: interface selection and port probing.
//!
//! Builds the `proto://ip:port` URI a rank registers with its RPC
//! runtime. The IPv4 address is the first interface whose dotted-quad
//! form starts with the configured subnet prefix. The port comes from a
//! probe over `[min_port, max_port]`: ranks on the same node start at
//! `min + node_rank % range` and step by the node size, so co-located
//! ranks probe disjoint sequences. If the window is exhausted the OS
//! assigns a port (bound with `SO_REUSEADDR` off, so a port handed to
//! one rank is not handed to its neighbor in the race window).

use std::os::fd::AsRawFd;

use log::{info, warn};
use nix::sys::socket::{
    bind, getsockname, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn,
};

use crate::config::ShuffleConfig;
use crate::error::{Error, Result};

/// Build the transport URI for this rank.
///
/// `node_rank`/`node_size` come from the fabric's node-local split.
/// Shared-memory schemes short-circuit to `proto://pid:min_port`.
pub fn prepare_uri(cfg: &ShuffleConfig, my_rank: u32, node_rank: u32, node_size: u32) -> Result<String> {
    cfg.check_ports()?;

    if cfg.proto.contains("sm") {
        if my_rank == 0 {
            warn!("using {} (single-node transport)", cfg.proto);
        }
        return Ok(format!("{}://{}:{}", cfg.proto, std::process::id(), cfg.min_port));
    }

    if my_rank == 0 {
        if cfg.proto.contains("tcp") {
            warn!("using {}", cfg.proto);
        } else {
            info!("using {}", cfg.proto);
        }
        if cfg.subnet == "127.0.0.1" {
            warn!("using subnet {}*", cfg.subnet);
        } else {
            info!("using subnet {}*", cfg.subnet);
        }
        info!("using port range [{},{}]", cfg.min_port, cfg.max_port);
    }

    let ip = select_ip(&cfg.subnet)?;
    let port = probe_port(cfg.min_port, cfg.max_port, node_rank, node_size)?;
    Ok(format!("{}://{}:{}", cfg.proto, ip, port))
}

/// First IPv4 interface address whose dotted-quad form has `subnet` as
/// a prefix.
pub fn select_ip(subnet: &str) -> Result<String> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| Error::Config(format!("getifaddrs: {}", e)))?;
    for ifaddr in addrs {
        if let Some(storage) = ifaddr.address {
            if let Some(sin) = storage.as_sockaddr_in() {
                let ip = sin.ip().to_string();
                if ip.starts_with(subnet) {
                    return Ok(ip);
                }
            }
        }
    }
    Err(Error::Config(format!("no ip addr matches subnet {}*", subnet)))
}

/// Probe `[min, max]` for a bindable port, starting at
/// `min + node_rank % range` and stepping by `node_size`. Falls back to
/// an OS-assigned port when the window is exhausted.
pub fn probe_port(min: u16, max: u16, node_rank: u32, node_size: u32) -> Result<u16> {
    if max < min || min < 1 {
        return Err(Error::Config("bad min-max port".to_string()));
    }
    let range = (max - min) as u32 + 1;
    let step = node_size.max(1);

    let mut port = min as u32 + node_rank % range;
    while port <= max as u32 {
        if try_bind(port as u16, true)?.is_some() {
            return Ok(port as u16);
        }
        port += step;
    }

    warn!("no free ports in [{},{}], auto detecting", min, max);
    match try_bind(0, false)? {
        Some(port) if port != 0 => Ok(port),
        _ => Err(Error::Config("no free ports".to_string())),
    }
}

/// Bind a throwaway TCP socket on `port`. Returns the bound port on
/// success, `None` when the address is busy. `port == 0` asks the OS to
/// pick one.
fn try_bind(port: u16, reuse_addr: bool) -> Result<Option<u16>> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(|e| Error::Config(format!("socket: {}", e)))?;
    setsockopt(&fd, sockopt::ReuseAddr, &reuse_addr)
        .map_err(|e| Error::Config(format!("setsockopt: {}", e)))?;

    let addr = SockaddrIn::new(0, 0, 0, 0, port);
    if bind(fd.as_raw_fd(), &addr).is_err() {
        return Ok(None);
    }
    let bound: SockaddrIn =
        getsockname(fd.as_raw_fd()).map_err(|e| Error::Config(format!("getsockname: {}", e)))?;
    Ok(Some(bound.port()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShuffleConfig;

    #[test]
    fn test_bad_port_window() {
        assert!(probe_port(9000, 8000, 0, 1).is_err());
        assert!(probe_port(0, 100, 0, 1).is_err());
    }

    #[test]
    fn test_probe_single_port_window() {
        // min == max: exactly one candidate, then the OS fallback. The
        // probe must return something bindable either way.
        let port = probe_port(54321, 54321, 0, 1).unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn test_probe_busy_window_falls_back() {
        // Hold the single in-window port so the probe is forced into
        // the OS-assigned fallback.
        let holder = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let busy = holder.local_addr().unwrap().port();
        let port = probe_port(busy, busy, 0, 1).unwrap();
        assert_ne!(port, 0);
        assert_ne!(port, busy);
    }

    #[test]
    fn test_loopback_always_selectable() {
        let ip = select_ip("127.").unwrap();
        assert!(ip.starts_with("127."));
    }

    #[test]
    fn test_unmatchable_subnet() {
        assert!(select_ip("203.0.113.").is_err());
    }

    #[test]
    fn test_sm_uri_shape() {
        let cfg = ShuffleConfig::new()
            .with_proto("na+sm")
            .with_port_range(6000, 6010);
        let uri = prepare_uri(&cfg, 0, 0, 1).unwrap();
        assert!(uri.starts_with("na+sm://"));
        assert!(uri.ends_with(":6000"));
    }

    #[test]
    fn test_tcp_uri_shape() {
        let cfg = ShuffleConfig::new().with_subnet("127.");
        let uri = prepare_uri(&cfg, 1, 0, 1).unwrap();
        assert!(uri.starts_with("tcp://127."));
        let port: u16 = uri.rsplit(':').next().unwrap().parse().unwrap();
        assert_ne!(port, 0);
    }
}
