/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Bind address selection for a proxy's listeners.

use std::net::{IpAddr, Ipv6Addr};

use ipnetwork::IpNetwork;

use crate::{
    model::{Proxy, UNIX_ADDRESS_PREFIX},
    xds::{Address, CidrRange},
};

pub const WILDCARD_IPV4: &str = "0.0.0.0";
pub const WILDCARD_IPV6: &str = "::";
pub const LOCALHOST_IPV4: &str = "127.0.0.1";
pub const LOCALHOST_IPV6: &str = "::1";

/// The wildcard and loopback addresses matching the proxy's IP family.
///
/// Any non-loopback IPv4 address selects the IPv4 pair, otherwise the IPv6
/// pair is used, including when nothing in the list parses.
pub fn wildcard_and_localhost(proxy: &Proxy) -> (&'static str, &'static str) {
    let has_ipv4 = proxy
        .ip_addresses
        .iter()
        .filter_map(|ip| ip.parse::<IpAddr>().ok())
        .any(|ip| matches!(ip, IpAddr::V4(v4) if !v4.is_loopback()));

    if has_ipv4 {
        (WILDCARD_IPV4, LOCALHOST_IPV4)
    } else {
        (WILDCARD_IPV6, LOCALHOST_IPV6)
    }
}

/// The address inbound listeners bind to when they bind their own port: the
/// first globally routable unicast address, else the wildcard.
pub fn inbound_bind_ip(proxy: &Proxy) -> String {
    proxy
        .ip_addresses
        .iter()
        .filter_map(|ip| ip.parse::<IpAddr>().ok())
        .find(is_global_unicast)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| wildcard_and_localhost(proxy).0.to_owned())
}

/// Unicast and not loopback, link-local, unspecified, or broadcast. Private
/// ranges count as global.
pub fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            !(ip.is_unspecified()
                || ip.is_loopback()
                || ip.is_multicast()
                || ip.is_link_local()
                || ip.is_broadcast())
        }
        IpAddr::V6(ip) => {
            !(ip.is_unspecified()
                || ip.is_loopback()
                || ip.is_multicast()
                || is_unicast_link_local(ip))
        }
    }
}

fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

pub fn is_wildcard(address: &str) -> bool {
    address == WILDCARD_IPV4 || address == WILDCARD_IPV6
}

pub fn is_unspecified(address: &str) -> bool {
    match address.parse::<IpAddr>() {
        Ok(ip) => ip.is_unspecified(),
        Err(_) => false,
    }
}

/// The conflict registry key of a listener.
pub fn listener_key(bind: &str, port: u16) -> String {
    format!("{bind}:{port}")
}

/// A socket address, or a pipe when `bind` names a unix domain socket.
pub fn build_address(bind: &str, port: u16) -> Address {
    match bind.strip_prefix(UNIX_ADDRESS_PREFIX) {
        Some(path) => Address::Pipe { path: path.into() },
        None => Address::Socket {
            address: bind.into(),
            port_value: port,
        },
    }
}

/// Converts `10.0.0.1` or `10.0.0.0/8` into a CIDR range. Bare addresses get
/// a full-length prefix. Returns `None` for anything unparseable.
pub fn convert_address_to_cidr(address: &str) -> Option<CidrRange> {
    let network = match address.parse::<IpNetwork>() {
        Ok(network) => network,
        Err(error) => {
            tracing::debug!(%address, %error, "not a cidr range");
            return None;
        }
    };

    Some(CidrRange {
        address_prefix: network.ip().to_string(),
        prefix_len: network.prefix(),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn proxy(ips: &[&str]) -> Proxy {
        Proxy {
            ip_addresses: ips.iter().map(|ip| (*ip).to_owned()).collect(),
            ..<_>::default()
        }
    }

    #[test]
    fn wildcard_family() {
        assert_eq!(
            (WILDCARD_IPV4, LOCALHOST_IPV4),
            wildcard_and_localhost(&proxy(&["10.1.1.1"]))
        );
        assert_eq!(
            (WILDCARD_IPV4, LOCALHOST_IPV4),
            wildcard_and_localhost(&proxy(&["fe80::1", "10.1.1.1"]))
        );
        assert_eq!(
            (WILDCARD_IPV6, LOCALHOST_IPV6),
            wildcard_and_localhost(&proxy(&["2001:db8::1"]))
        );
        assert_eq!(
            (WILDCARD_IPV6, LOCALHOST_IPV6),
            wildcard_and_localhost(&proxy(&["127.0.0.1"]))
        );
    }

    #[test]
    fn wildcard_without_parseable_address() {
        assert_eq!(
            (WILDCARD_IPV6, LOCALHOST_IPV6),
            wildcard_and_localhost(&proxy(&[]))
        );
        assert_eq!(
            (WILDCARD_IPV6, LOCALHOST_IPV6),
            wildcard_and_localhost(&proxy(&["not-an-ip", ""]))
        );
    }

    #[test]
    fn inbound_bind() {
        assert_eq!("10.4.0.9", inbound_bind_ip(&proxy(&["127.0.0.1", "10.4.0.9"])));
        assert_eq!(
            "2001:db8::9",
            inbound_bind_ip(&proxy(&["fe80::1", "2001:db8::9"]))
        );
        assert_eq!("::", inbound_bind_ip(&proxy(&["fe80::1"])));
        assert_eq!("0.0.0.0", inbound_bind_ip(&proxy(&["169.254.0.1", "10.0.0.1/8"])));
    }

    #[test]
    fn cidr_conversion() {
        assert_eq!(
            Some(CidrRange {
                address_prefix: "10.0.0.1".into(),
                prefix_len: 32
            }),
            convert_address_to_cidr("10.0.0.1")
        );
        assert_eq!(
            Some(CidrRange {
                address_prefix: "10.0.0.0".into(),
                prefix_len: 16
            }),
            convert_address_to_cidr("10.0.0.0/16")
        );
        assert_eq!(
            Some(CidrRange {
                address_prefix: "2001:db8::".into(),
                prefix_len: 128
            }),
            convert_address_to_cidr("2001:db8::")
        );
        assert_eq!(None, convert_address_to_cidr("reviews"));
    }

    #[test]
    fn addresses() {
        assert_eq!(
            Address::Socket {
                address: "0.0.0.0".into(),
                port_value: 80
            },
            build_address("0.0.0.0", 80)
        );
        assert_eq!(
            Address::Pipe {
                path: "/var/run/app.sock".into()
            },
            build_address("unix:///var/run/app.sock", 0)
        );
        assert_eq!("10.0.0.1:80", listener_key("10.0.0.1", 80));
        assert!(is_unspecified("::"));
        assert!(!is_unspecified("10.0.0.1"));
    }
}
