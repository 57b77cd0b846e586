//! Endpoint addresses: `tcp://host:port`.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use url::Url;

use crate::error::{RpcError, RpcResult};

/// Where a connection is established.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for name resolution.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Parse an endpoint, also returning the `timeout` query parameter if present.
    pub fn parse_with_timeout(input: &str) -> RpcResult<(Self, Option<i64>)> {
        let invalid = |reason: &str| RpcError::InvalidProxy {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(input).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "tcp" {
            return Err(invalid("only the tcp transport is supported"));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?;
        let port = url.port().ok_or_else(|| invalid("missing port"))?;

        let mut timeout = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "timeout" => {
                    let ms = value
                        .parse::<i64>()
                        .map_err(|_| invalid("timeout must be an integer"))?;
                    timeout = Some(ms);
                }
                other => return Err(invalid(&format!("unknown endpoint option `{}`", other))),
            }
        }

        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        Ok((Self { host, port }, timeout))
    }
}

impl FromStr for Endpoint {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_timeout(s).map(|(endpoint, _)| endpoint)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::tcp(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}", self.authority())
    }
}
