use std::net::{IpAddr, Ipv4Addr};
use systemstat::{Platform, System};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Install the global `fmt` subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses. If none qualifies, falls back
/// to the address `local-ip-address` reports for the default route.
///
/// ## Returns
///
/// * `Some(IpAddr)`: The first routable network interface.
/// * `None`: The host exposes no usable address at all.
pub fn select_host_address() -> Option<IpAddr> {
    let system = System::new();

    match system.networks() {
        Ok(networks) => {
            for net in networks.values() {
                for n in &net.addrs {
                    if let systemstat::IpAddr::V4(v) = n.addr {
                        if is_routable_v4(&v) {
                            return Some(IpAddr::V4(v));
                        }
                    }
                }
            }
        }
        Err(e) => warn!("could not list network interfaces: {}", e),
    }

    local_ip_address::local_ip().ok()
}

fn is_routable_v4(v: &Ipv4Addr) -> bool {
    !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() && !v.is_unspecified()
}
