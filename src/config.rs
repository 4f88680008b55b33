//! Listener address parsing.
//!
//! Listeners are described by comma-separated URL-like addresses:
//!
//! ```text
//! sflow://:6343,netflow://0.0.0.0:2055?count=4&workers=8&blocking=false&queue_size=500000
//! ```
//!
//! `count` is the number of reuse-port sockets, `workers` the number of
//! queue consumers (defaulting to twice the sockets), `queue_size` the
//! bound of the shared queue (defaulting to one million datagrams when
//! non-blocking).

use std::str::FromStr;

use thiserror::Error;

use crate::pipeline::Scheme;
use crate::receiver::{UdpReceiverConfig, DEFAULT_QUEUE_SIZE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("unknown scheme {scheme:?} (expected sflow, netflow or flow)")]
    UnknownScheme { scheme: String },

    #[error("port {port} is out of range")]
    PortOutOfRange { port: u64 },

    #[error("invalid value for {param}: {value:?}")]
    InvalidParam { param: &'static str, value: String },
}

/// One parsed listener address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub receiver: UdpReceiverConfig,
}

impl ListenerSpec {
    /// Parses a comma-separated list of listener addresses.
    pub fn parse_list(input: &str) -> Result<Vec<Self>, ConfigError> {
        input
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Self::parse)
            .collect()
    }

    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidAddress {
            addr: input.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = input.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let scheme =
            Scheme::from_str(scheme).map_err(|_| ConfigError::UnknownScheme {
                scheme: scheme.to_string(),
            })?;

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };

        // `[::1]:2055` keeps its brackets; `:6343` means all interfaces.
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        let host = if host.is_empty() {
            "0.0.0.0".to_string()
        } else {
            host.to_string()
        };
        let port_number: u64 = port.parse().map_err(|_| invalid("port is not a number"))?;
        if port_number < 1 || port_number > 65_535 {
            return Err(ConfigError::PortOutOfRange { port: port_number });
        }

        let mut sockets = 1usize;
        let mut workers = 0usize;
        let mut blocking = false;
        let mut queue_size: Option<usize> = None;

        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                match name {
                    "count" => {
                        sockets = parse_param("count", value)?;
                    }
                    "workers" => {
                        workers = parse_param("workers", value)?;
                    }
                    "blocking" => {
                        blocking = value.parse().map_err(|_| ConfigError::InvalidParam {
                            param: "blocking",
                            value: value.to_string(),
                        })?;
                    }
                    "queue_size" => {
                        queue_size = Some(parse_param("queue_size", value)?);
                    }
                    _ => {
                        return Err(ConfigError::InvalidParam {
                            param: "query",
                            value: name.to_string(),
                        });
                    }
                }
            }
        }

        let sockets = sockets.max(1);
        let workers = if workers == 0 { sockets * 2 } else { workers };
        let queue_size = match queue_size {
            Some(size) => size.max(1),
            None if blocking => 1,
            None => DEFAULT_QUEUE_SIZE,
        };

        Ok(Self {
            scheme,
            host,
            port: port_number as u16,
            receiver: UdpReceiverConfig {
                sockets,
                workers,
                queue_size,
                blocking,
            },
        })
    }
}

fn parse_param(param: &'static str, value: &str) -> Result<usize, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidParam {
        param,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_address() {
        let spec =
            ListenerSpec::parse("netflow://127.0.0.1:2055?count=4&workers=8&blocking=true&queue_size=500")
                .unwrap();
        assert_eq!(spec.scheme, Scheme::NetFlow);
        assert_eq!(spec.host, "127.0.0.1");
        assert_eq!(spec.port, 2055);
        assert_eq!(spec.receiver.sockets, 4);
        assert_eq!(spec.receiver.workers, 8);
        assert!(spec.receiver.blocking);
        assert_eq!(spec.receiver.queue_size, 500);
    }

    #[test]
    fn defaults_follow_the_contract() {
        let spec = ListenerSpec::parse("sflow://:6343").unwrap();
        assert_eq!(spec.host, "0.0.0.0");
        assert_eq!(spec.receiver.sockets, 1);
        // workers default to twice the sockets.
        assert_eq!(spec.receiver.workers, 2);
        assert!(!spec.receiver.blocking);
        assert_eq!(spec.receiver.queue_size, DEFAULT_QUEUE_SIZE);

        let spec = ListenerSpec::parse("sflow://:6343?count=3").unwrap();
        assert_eq!(spec.receiver.sockets, 3);
        assert_eq!(spec.receiver.workers, 6);
    }

    #[test]
    fn parses_a_list() {
        let specs = ListenerSpec::parse_list("sflow://:6343,netflow://:2055,flow://:9999").unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].scheme, Scheme::SFlow);
        assert_eq!(specs[1].scheme, Scheme::NetFlow);
        assert_eq!(specs[2].scheme, Scheme::Flow);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            ListenerSpec::parse("gopher://:2055"),
            Err(ConfigError::UnknownScheme { .. })
        ));
        assert!(matches!(
            ListenerSpec::parse("netflow://:0"),
            Err(ConfigError::PortOutOfRange { .. })
        ));
        assert!(matches!(
            ListenerSpec::parse("netflow://:70000"),
            Err(ConfigError::PortOutOfRange { .. })
        ));
        assert!(matches!(
            ListenerSpec::parse("netflow://no-port"),
            Err(ConfigError::InvalidAddress { .. })
        ));
        assert!(matches!(
            ListenerSpec::parse("netflow://:2055?bogus=1"),
            Err(ConfigError::InvalidParam { .. })
        ));
    }

    #[test]
    fn ipv6_hosts_keep_brackets() {
        let spec = ListenerSpec::parse("netflow://[::1]:2055").unwrap();
        assert_eq!(spec.host, "[::1]");
        assert_eq!(spec.port, 2055);
    }
}
