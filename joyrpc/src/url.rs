use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Well-known parameter names carried on a [`Url`].
pub mod params {
    pub const ALIAS: &str = "alias";
    pub const WEIGHT: &str = "weight";
    pub const WARMUP: &str = "warmup";
    pub const REGION: &str = "region";
    pub const PAYLOAD: &str = "payload";
    pub const TIMEOUT: &str = "timeout";
    pub const RETRIES: &str = "retries";
    pub const CONNECT_TIMEOUT: &str = "connectTimeout";
    pub const HEARTBEAT_INTERVAL: &str = "heartbeatInterval";
    pub const HEARTBEAT_MODE: &str = "heartbeatMode";
    pub const SHUTDOWN_TIMEOUT: &str = "shutdownTimeout";
    pub const OFFLINE_TIMEOUT: &str = "offlineTimeout";
    pub const GRACEFULLY_SHUTDOWN: &str = "gracefullyShutdown";
    pub const METHOD_INCLUDE: &str = "methodInclude";
    pub const METHOD_EXCLUDE: &str = "methodExclude";
    pub const SSL_ENABLE: &str = "ssl.enable";
    pub const DELAY: &str = "delay";
    pub const SHARE: &str = "share";
    pub const STICKY: &str = "sticky";
    pub const LOADBALANCE: &str = "loadbalance";
    pub const SERIALIZATION: &str = "serialization";
}

/// Canonical service address: `scheme://host:port/interface?key=value`.
///
/// A `Url` is immutable once built and is used as the cache key for channels,
/// nodes, and registry entries. Two urls are equal iff every field matches,
/// parameters included. Typed getters expose parameters with defaults so
/// callers never parse strings at the use site.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Url {
    scheme: String,
    host: String,
    port: u16,
    interface: String,
    params: BTreeMap<String, String>,
}

impl Url {
    #[must_use]
    pub fn new(scheme: &str, host: &str, port: u16, interface: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            interface: interface.to_string(),
            params: BTreeMap::new(),
        }
    }

    /// Parses `scheme://host:port/interface?key=value&key2=value2`.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error when any component is missing or malformed.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            Error::new(ErrorKind::Config, format!("invalid url `{input}`: {reason}"))
        };

        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        let (authority_path, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };
        let (authority, interface) = authority_path
            .split_once('/')
            .ok_or_else(|| invalid("missing interface path"))?;
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
        if scheme.is_empty() || host.is_empty() || interface.is_empty() {
            return Err(invalid("empty component"));
        }

        let mut params = BTreeMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').ok_or_else(|| invalid("bad query"))?;
                params.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            interface: interface.to_string(),
            params,
        })
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// `host:port` form accepted by the connector and used as pool key.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn string_param(&self, key: &str, default: &str) -> String {
        self.param(key).unwrap_or(default).to_string()
    }

    #[must_use]
    pub fn u32_param(&self, key: &str, default: u32) -> u32 {
        self.param(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    #[must_use]
    pub fn bool_param(&self, key: &str, default: bool) -> bool {
        self.param(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Duration parameter expressed in milliseconds.
    #[must_use]
    pub fn duration_param(&self, key: &str, default: Duration) -> Duration {
        self.param(key)
            .and_then(|v| v.parse().ok())
            .map_or(default, Duration::from_millis)
    }

    /// Comma-separated list parameter; empty when absent.
    #[must_use]
    pub fn list_param(&self, key: &str) -> Vec<String> {
        self.param(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Full parameter map, sorted by name.
    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Returns a new url with the parameter set; the receiver is unchanged.
    #[must_use]
    pub fn with_param(&self, key: &str, value: &str) -> Self {
        let mut url = self.clone();
        url.params.insert(key.to_string(), value.to_string());
        url
    }

    /// Returns a new url with the parameter removed; the receiver is
    /// unchanged.
    #[must_use]
    pub fn without_param(&self, key: &str) -> Self {
        let mut url = self.clone();
        url.params.remove(key);
        url
    }
}

impl std::fmt::Display for Url {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}:{}/{}",
            self.scheme, self.host, self.port, self.interface
        )?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{key}={value}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Url {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let url = Url::parse("joyrpc://127.0.0.1:22000/io.joyrpc.Echo?alias=prod&weight=200")
            .unwrap();
        assert_eq!(url.scheme(), "joyrpc");
        assert_eq!(url.host(), "127.0.0.1");
        assert_eq!(url.port(), 22000);
        assert_eq!(url.interface(), "io.joyrpc.Echo");
        assert_eq!(url.endpoint(), "127.0.0.1:22000");
        assert_eq!(url.param(params::ALIAS), Some("prod"));
        assert_eq!(url.u32_param(params::WEIGHT, 100), 200);

        let display = url.to_string();
        assert_eq!(Url::parse(&display).unwrap(), url);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Url::parse("no-scheme/if").is_err());
        assert!(Url::parse("joyrpc://127.0.0.1:22000").is_err());
        assert!(Url::parse("joyrpc://127.0.0.1/io.Echo").is_err());
        assert!(Url::parse("joyrpc://127.0.0.1:eight/io.Echo").is_err());
    }

    #[test]
    fn test_equality_includes_params() {
        let base = Url::parse("joyrpc://127.0.0.1:22000/io.joyrpc.Echo").unwrap();
        let tagged = base.with_param(params::REGION, "east");
        assert_ne!(base, tagged);
        assert_eq!(base, base.clone());
        assert_eq!(base.param(params::REGION), None);
        assert_eq!(tagged.without_param(params::REGION), base);
    }

    #[test]
    fn test_typed_getters_fall_back() {
        let url = Url::parse("joyrpc://127.0.0.1:22000/io.joyrpc.Echo?timeout=250").unwrap();
        assert_eq!(
            url.duration_param(params::TIMEOUT, Duration::from_secs(1)),
            Duration::from_millis(250)
        );
        assert_eq!(
            url.duration_param(params::CONNECT_TIMEOUT, Duration::from_secs(3)),
            Duration::from_secs(3)
        );
        assert!(url.bool_param(params::SHARE, true));
        assert!(url.list_param(params::METHOD_INCLUDE).is_empty());

        let url = url.with_param(params::METHOD_INCLUDE, "echo, greet");
        assert_eq!(url.list_param(params::METHOD_INCLUDE), ["echo", "greet"]);
    }
}
