//! Network settings for the virtual interface.
//!
//! `build` is pure: all traffic goes through the interface except private
//! ranges and loopback, HTTP and HTTPS are proxied to the local engine, and
//! DNS is pinned to public resolvers. Applying the result is the host's job.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Serialize, Serializer};

pub const TUNNEL_REMOTE_ADDRESS: &str = "127.0.0.1";
pub const TUNNEL_SUBNET_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);
pub const DNS_SERVERS: [Ipv4Addr; 2] = [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)];
pub const TUNNEL_MTU: u16 = 1500;

/// Private ranges and loopback kept off the tunnel.
pub const EXCLUDED_ROUTES: [Ipv4Route; 4] = [
    Ipv4Route::new(Ipv4Addr::new(192, 168, 0, 0), 16),
    Ipv4Route::new(Ipv4Addr::new(10, 0, 0, 0), 8),
    Ipv4Route::new(Ipv4Addr::new(172, 16, 0, 0), 12),
    Ipv4Route::new(Ipv4Addr::new(127, 0, 0, 0), 8),
];

/// Hosts the OS proxy settings send direct.
pub const PROXY_EXCEPTIONS: [&str; 6] = [
    "192.168.0.0/16",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "127.0.0.1",
    "localhost",
    "*.local",
];

/// An IPv4 CIDR route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Route {
    destination: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Route {
    /// Build a route. `prefix_len` is clamped to 32 and host bits are cleared.
    pub const fn new(destination: Ipv4Addr, prefix_len: u8) -> Self {
        let prefix_len = if prefix_len > 32 { 32 } else { prefix_len };
        let bits = u32::from_be_bytes(destination.octets()) & Self::mask_bits(prefix_len);
        let o = bits.to_be_bytes();
        Self {
            destination: Ipv4Addr::new(o[0], o[1], o[2], o[3]),
            prefix_len,
        }
    }

    /// `0.0.0.0/0`
    pub const fn default_route() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, 0)
    }

    const fn mask_bits(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len as u32)
        }
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.destination
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(Self::mask_bits(self.prefix_len))
    }

    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask_bits(self.prefix_len) == u32::from(self.destination)
    }
}

impl fmt::Display for Ipv4Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.destination, self.prefix_len)
    }
}

impl Serialize for Ipv4Route {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyServer {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxySettings {
    pub http_server: ProxyServer,
    pub https_server: ProxyServer,
    pub http_enabled: bool,
    pub https_enabled: bool,
    pub auto_proxy_configuration_enabled: bool,
    pub exclude_simple_hostnames: bool,
    pub exception_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ipv4Settings {
    pub addresses: Vec<Ipv4Addr>,
    pub subnet_masks: Vec<Ipv4Addr>,
    pub included_routes: Vec<Ipv4Route>,
    pub excluded_routes: Vec<Ipv4Route>,
}

/// Everything the host applies to the virtual interface on start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelNetworkSettings {
    pub remote_address: String,
    pub proxy: ProxySettings,
    pub ipv4: Ipv4Settings,
    pub dns_servers: Vec<Ipv4Addr>,
    pub mtu: u16,
}

impl TunnelNetworkSettings {
    pub fn proxy_host(&self) -> &str {
        &self.proxy.http_server.address
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy.http_server.port
    }

    pub fn included_routes(&self) -> &[Ipv4Route] {
        &self.ipv4.included_routes
    }

    pub fn excluded_routes(&self) -> &[Ipv4Route] {
        &self.ipv4.excluded_routes
    }

    /// True when traffic to `addr` enters the tunnel: covered by an included
    /// route and by no excluded route.
    pub fn routes_through_tunnel(&self, addr: Ipv4Addr) -> bool {
        self.ipv4.included_routes.iter().any(|r| r.contains(addr))
            && !self.ipv4.excluded_routes.iter().any(|r| r.contains(addr))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub fn build(proxy_host: &str, proxy_port: u16) -> TunnelNetworkSettings {
    let server = ProxyServer {
        address: proxy_host.to_string(),
        port: proxy_port,
    };

    TunnelNetworkSettings {
        remote_address: TUNNEL_REMOTE_ADDRESS.to_string(),
        proxy: ProxySettings {
            http_server: server.clone(),
            https_server: server,
            http_enabled: true,
            https_enabled: true,
            auto_proxy_configuration_enabled: false,
            exclude_simple_hostnames: true,
            exception_list: PROXY_EXCEPTIONS.iter().map(|s| s.to_string()).collect(),
        },
        ipv4: Ipv4Settings {
            addresses: vec![Ipv4Addr::LOCALHOST],
            subnet_masks: vec![TUNNEL_SUBNET_MASK],
            included_routes: vec![Ipv4Route::default_route()],
            excluded_routes: EXCLUDED_ROUTES.to_vec(),
        },
        dns_servers: DNS_SERVERS.to_vec(),
        mtu: TUNNEL_MTU,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_masks_and_display() {
        let r = Ipv4Route::new(Ipv4Addr::new(172, 16, 0, 0), 12);
        assert_eq!(r.subnet_mask(), Ipv4Addr::new(255, 240, 0, 0));
        assert_eq!(r.to_string(), "172.16.0.0/12");
        assert!(r.contains(Ipv4Addr::new(172, 31, 255, 255)));
        assert!(!r.contains(Ipv4Addr::new(172, 32, 0, 0)));

        let d = Ipv4Route::default_route();
        assert!(d.is_default());
        assert_eq!(d.subnet_mask(), Ipv4Addr::UNSPECIFIED);
        assert!(d.contains(Ipv4Addr::new(93, 184, 216, 34)));

        // Host bits are cleared
        assert_eq!(
            Ipv4Route::new(Ipv4Addr::new(10, 1, 2, 3), 8).destination(),
            Ipv4Addr::new(10, 0, 0, 0)
        );
    }

    #[test]
    fn includes_default_and_excludes_private_and_loopback() {
        for (host, port) in [("127.0.0.1", 8888), ("localhost", 1), ("10.0.0.1", 65535)] {
            let s = build(host, port);

            assert!(s.included_routes().iter().any(|r| r.is_default()));
            for cidr in ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "127.0.0.0/8"] {
                assert!(
                    s.excluded_routes().iter().any(|r| r.to_string() == cidr),
                    "{} not excluded",
                    cidr
                );
            }

            for addr in [
                Ipv4Addr::new(10, 20, 30, 40),
                Ipv4Addr::new(172, 20, 0, 1),
                Ipv4Addr::new(192, 168, 1, 1),
                Ipv4Addr::LOCALHOST,
            ] {
                assert!(!s.routes_through_tunnel(addr), "{} captured", addr);
            }
            assert!(s.routes_through_tunnel(Ipv4Addr::new(17, 253, 144, 10)));
        }
    }

    #[test]
    fn proxies_http_and_https_to_engine() {
        let s = build("127.0.0.1", 8888);
        assert_eq!(s.proxy_host(), "127.0.0.1");
        assert_eq!(s.proxy_port(), 8888);
        assert_eq!(s.proxy.https_server, s.proxy.http_server);
        assert!(s.proxy.http_enabled && s.proxy.https_enabled);
        assert!(!s.proxy.auto_proxy_configuration_enabled);
        assert!(s.proxy.exclude_simple_hostnames);
        assert!(s.proxy.exception_list.iter().any(|e| e == "*.local"));
        assert!(s.proxy.exception_list.iter().any(|e| e == "localhost"));
    }

    #[test]
    fn dns_and_mtu_are_fixed() {
        let s = build("127.0.0.1", 8888);
        assert_eq!(s.dns_servers, vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)]);
        assert_eq!(s.mtu, 1500);
        assert_eq!(s.remote_address, "127.0.0.1");
    }

    #[test]
    fn build_is_deterministic() {
        assert_eq!(build("127.0.0.1", 8888), build("127.0.0.1", 8888));
    }

    #[test]
    fn json_carries_cidr_strings() {
        let json: serde_json::Value =
            serde_json::from_str(&build("127.0.0.1", 8888).to_json().unwrap()).unwrap();
        assert_eq!(json["ipv4"]["included_routes"][0], "0.0.0.0/0");
        assert_eq!(json["proxy"]["http_server"]["port"], 8888);
        assert_eq!(json["dns_servers"][1], "1.1.1.1");
    }
}
