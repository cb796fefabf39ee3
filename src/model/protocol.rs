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

use serde::{Deserialize, Serialize};

/// Application protocol declared on a service port.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Serialize,
    Eq,
    Hash,
    PartialEq,
    Ord,
    PartialOrd,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    #[serde(rename = "GRPC")]
    #[strum(serialize = "GRPC")]
    Grpc,
    #[serde(rename = "GRPC-Web")]
    #[strum(serialize = "GRPC-Web")]
    GrpcWeb,
    #[serde(rename = "HTTP")]
    #[strum(serialize = "HTTP")]
    Http,
    #[serde(rename = "HTTP2")]
    #[strum(serialize = "HTTP2")]
    Http2,
    #[serde(rename = "HTTPS")]
    #[strum(serialize = "HTTPS")]
    Https,
    #[default]
    #[serde(rename = "TCP")]
    #[strum(serialize = "TCP")]
    Tcp,
    #[serde(rename = "TLS")]
    #[strum(serialize = "TLS")]
    Tls,
    #[serde(rename = "UDP")]
    #[strum(serialize = "UDP")]
    Udp,
    #[serde(rename = "Mongo")]
    #[strum(serialize = "Mongo")]
    Mongo,
    #[serde(rename = "Redis")]
    #[strum(serialize = "Redis")]
    Redis,
    #[serde(rename = "MySQL")]
    #[strum(serialize = "MySQL")]
    Mysql,
    #[serde(rename = "UnsupportedProtocol")]
    #[strum(serialize = "UnsupportedProtocol")]
    Unsupported,
}

impl Protocol {
    /// Parses a protocol name case-insensitively. Unknown names map to
    /// [`Protocol::Unsupported`].
    pub fn parse(name: &str) -> Self {
        name.parse().unwrap_or(Self::Unsupported)
    }

    pub fn is_http(self) -> bool {
        matches!(self, Self::Http | Self::Http2 | Self::Grpc | Self::GrpcWeb)
    }

    /// HTTP/2 framing is used on the wire.
    pub fn is_http2(self) -> bool {
        matches!(self, Self::Http2 | Self::Grpc | Self::GrpcWeb)
    }

    /// Proxied as an opaque byte stream.
    pub fn is_tcp(self) -> bool {
        matches!(
            self,
            Self::Tcp | Self::Https | Self::Tls | Self::Mongo | Self::Redis | Self::Mysql
        )
    }

    pub fn listener_protocol(self) -> ListenerProtocol {
        if self.is_http() {
            ListenerProtocol::Http
        } else if self.is_tcp() {
            ListenerProtocol::Tcp
        } else {
            ListenerProtocol::Unknown
        }
    }
}

/// The processing a listener applies to a connection.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, Hash, PartialEq, strum_macros::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ListenerProtocol {
    Http,
    Tcp,
    Unknown,
}

impl From<Protocol> for ListenerProtocol {
    fn from(protocol: Protocol) -> Self {
        protocol.listener_protocol()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Protocol::Http, Protocol::parse("http"));
        assert_eq!(Protocol::GrpcWeb, Protocol::parse("grpc-web"));
        assert_eq!(Protocol::Mysql, Protocol::parse("MYSQL"));
        assert_eq!(Protocol::Unsupported, Protocol::parse("thrift"));
        assert_eq!(Protocol::Unsupported, Protocol::parse(""));
    }

    #[test]
    fn classification() {
        assert_eq!(ListenerProtocol::Http, Protocol::Grpc.into());
        assert_eq!(ListenerProtocol::Tcp, Protocol::Https.into());
        assert_eq!(ListenerProtocol::Tcp, Protocol::Redis.into());
        assert_eq!(ListenerProtocol::Unknown, Protocol::Udp.into());
        assert_eq!(ListenerProtocol::Unknown, Protocol::Unsupported.into());
        assert!(Protocol::GrpcWeb.is_http2());
        assert!(!Protocol::Http.is_http2());
    }

    #[test]
    fn display_matches_wire_names() {
        assert_eq!("GRPC-Web", Protocol::GrpcWeb.to_string());
        assert_eq!(
            "\"HTTP2\"",
            serde_json::to_string(&Protocol::Http2).unwrap()
        );
        assert_eq!("HTTP", ListenerProtocol::Http.to_string());
    }
}
