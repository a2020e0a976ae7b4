//! Transport URI parsing and role-aware construction.
//!
//! ```text
//! local://                            spawned child over a socket pair
//! tcp://:PORT                         listen (adapter side only)
//! tcp://HOST:PORT[?timeout_ms=N]      dial (harness side only)
//! serial:///dev/ttyUSB0[?baud=N]      UART
//! shm://NAME                          shared memory (Linux)
//! ```
//!
//! The two ends of a session must never both listen or both dial, so [`open`] refuses
//! the forms that do not belong to the caller's [`Role`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use super::{SerialTransport, TcpServer, TcpTransport, Transport, serial::DEFAULT_BAUD_RATE};
use crate::{CortexError, Result};

/// Dial timeout used when a `tcp://` URI does not carry `timeout_ms`.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Which end of the session is opening the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The benchmarking harness: dials TCP, creates shared memory, spawns local adapters.
    Harness,
    /// The device adapter: listens on TCP, attaches to shared memory, uses stdio locally.
    Adapter,
}

/// Parsed transport URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportUri {
    Local,
    TcpListen { port: u16 },
    TcpConnect { host: String, port: u16, timeout: Option<Duration> },
    Serial { path: String, baud: u32 },
    Shm { name: String },
}

impl TransportUri {
    /// Parse a URI string.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| CortexError::invalid_uri(uri, "missing '://' scheme separator"))?;
        let (body, query) = match rest.split_once('?') {
            Some((body, query)) => (body, Some(query)),
            None => (rest, None),
        };
        let params = parse_query(uri, query)?;

        match scheme {
            "local" => {
                if !body.is_empty() || !params.is_empty() {
                    return Err(CortexError::invalid_uri(uri, "local:// takes no address"));
                }
                Ok(TransportUri::Local)
            }
            "tcp" => {
                let (host, port) = body
                    .rsplit_once(':')
                    .ok_or_else(|| CortexError::invalid_uri(uri, "expected HOST:PORT or :PORT"))?;
                let port: u16 =
                    port.parse().map_err(|_| CortexError::invalid_uri(uri, "invalid port"))?;
                let timeout = lookup(&params, "timeout_ms")
                    .map(|v| {
                        v.parse::<u64>()
                            .map(Duration::from_millis)
                            .map_err(|_| CortexError::invalid_uri(uri, "invalid timeout_ms"))
                    })
                    .transpose()?;
                reject_unknown(uri, &params, &["timeout_ms"])?;
                if host.is_empty() {
                    if timeout.is_some() {
                        return Err(CortexError::invalid_uri(uri, "timeout_ms only applies to dialing"));
                    }
                    Ok(TransportUri::TcpListen { port })
                } else {
                    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
                    Ok(TransportUri::TcpConnect { host, port, timeout })
                }
            }
            "serial" => {
                if !body.starts_with('/') {
                    return Err(CortexError::invalid_uri(uri, "serial path must be absolute"));
                }
                let baud = lookup(&params, "baud")
                    .map(|v| v.parse::<u32>().map_err(|_| CortexError::invalid_uri(uri, "invalid baud")))
                    .transpose()?
                    .unwrap_or(DEFAULT_BAUD_RATE);
                if baud == 0 {
                    return Err(CortexError::invalid_uri(uri, "baud must be positive"));
                }
                reject_unknown(uri, &params, &["baud"])?;
                Ok(TransportUri::Serial { path: body.to_string(), baud })
            }
            "shm" => {
                if body.is_empty() || body.contains('/') {
                    return Err(CortexError::invalid_uri(uri, "shm name must be a single path segment"));
                }
                reject_unknown(uri, &params, &[])?;
                Ok(TransportUri::Shm { name: body.to_string() })
            }
            other => Err(CortexError::invalid_uri(uri, format!("unknown scheme '{}'", other))),
        }
    }

    /// Whether the harness has to launch the adapter process itself.
    pub fn is_local(&self) -> bool {
        matches!(self, TransportUri::Local)
    }
}

impl FromStr for TransportUri {
    type Err = CortexError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for TransportUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportUri::Local => write!(f, "local://"),
            TransportUri::TcpListen { port } => write!(f, "tcp://:{}", port),
            TransportUri::TcpConnect { host, port, timeout } => {
                if host.contains(':') {
                    write!(f, "tcp://[{}]:{}", host, port)?;
                } else {
                    write!(f, "tcp://{}:{}", host, port)?;
                }
                if let Some(timeout) = timeout {
                    write!(f, "?timeout_ms={}", timeout.as_millis())?;
                }
                Ok(())
            }
            TransportUri::Serial { path, baud } => write!(f, "serial://{}?baud={}", path, baud),
            TransportUri::Shm { name } => write!(f, "shm://{}", name),
        }
    }
}

/// Open the transport named by `uri` for the given role.
///
/// `accept_timeout` bounds how long an adapter waits for the harness on `tcp://:PORT`.
/// `local://` cannot be opened by the harness this way; local adapters are spawned
/// by the device layer with a socket pair instead.
pub fn open(uri: &TransportUri, role: Role, accept_timeout: Duration) -> Result<Box<dyn Transport>> {
    debug!(%uri, ?role, "Opening transport");
    match (uri, role) {
        #[cfg(unix)]
        (TransportUri::Local, Role::Adapter) => Ok(Box::new(super::StdioTransport::new()?)),
        #[cfg(not(unix))]
        (TransportUri::Local, Role::Adapter) => {
            Err(CortexError::unsupported_platform("local:// stdio transport", "Unix"))
        }
        (TransportUri::Local, Role::Harness) => Err(CortexError::invalid_uri(
            uri.to_string(),
            "local:// devices are spawned by the harness, not opened",
        )),
        (TransportUri::TcpListen { port }, Role::Adapter) => {
            Ok(Box::new(TcpServer::bind(*port)?.accept(accept_timeout)?))
        }
        (TransportUri::TcpListen { .. }, Role::Harness) => Err(CortexError::invalid_uri(
            uri.to_string(),
            "the harness dials adapters; use tcp://HOST:PORT",
        )),
        (TransportUri::TcpConnect { host, port, timeout }, Role::Harness) => Ok(Box::new(
            TcpTransport::connect(host, *port, timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))?,
        )),
        (TransportUri::TcpConnect { .. }, Role::Adapter) => Err(CortexError::invalid_uri(
            uri.to_string(),
            "adapters listen and never dial out; use tcp://:PORT",
        )),
        (TransportUri::Serial { path, baud }, _) => Ok(Box::new(SerialTransport::open(path, *baud)?)),
        #[cfg(target_os = "linux")]
        (TransportUri::Shm { name }, Role::Harness) => Ok(Box::new(super::ShmTransport::create(name)?)),
        #[cfg(target_os = "linux")]
        (TransportUri::Shm { name }, Role::Adapter) => Ok(Box::new(super::ShmTransport::open(name)?)),
        #[cfg(not(target_os = "linux"))]
        (TransportUri::Shm { .. }, _) => {
            Err(CortexError::unsupported_platform("shm:// transport", "Linux"))
        }
    }
}

fn parse_query<'a>(uri: &str, query: Option<&'a str>) -> Result<Vec<(&'a str, &'a str)>> {
    let Some(query) = query else {
        return Ok(Vec::new());
    };
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .ok_or_else(|| CortexError::invalid_uri(uri, format!("query '{}' is not KEY=VALUE", pair)))
        })
        .collect()
}

fn lookup<'a>(params: &[(&str, &'a str)], key: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

fn reject_unknown(uri: &str, params: &[(&str, &str)], allowed: &[&str]) -> Result<()> {
    match params.iter().find(|(k, _)| !allowed.contains(k)) {
        Some((k, _)) => Err(CortexError::invalid_uri(uri, format!("unknown parameter '{}'", k))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_form() {
        assert_eq!(TransportUri::parse("local://").unwrap(), TransportUri::Local);
        assert_eq!(TransportUri::parse("tcp://:9000").unwrap(), TransportUri::TcpListen { port: 9000 });
        assert_eq!(
            TransportUri::parse("tcp://jetson.local:9000?timeout_ms=250").unwrap(),
            TransportUri::TcpConnect {
                host: "jetson.local".into(),
                port: 9000,
                timeout: Some(Duration::from_millis(250)),
            }
        );
        assert_eq!(
            TransportUri::parse("serial:///dev/ttyUSB0?baud=921600").unwrap(),
            TransportUri::Serial { path: "/dev/ttyUSB0".into(), baud: 921_600 }
        );
        assert_eq!(
            TransportUri::parse("serial:///dev/ttyACM0").unwrap(),
            TransportUri::Serial { path: "/dev/ttyACM0".into(), baud: DEFAULT_BAUD_RATE }
        );
        assert_eq!(TransportUri::parse("shm://bench0").unwrap(), TransportUri::Shm { name: "bench0".into() });
    }

    #[test]
    fn rejects_malformed_uris() {
        for bad in [
            "tcp:9000",
            "udp://:9000",
            "tcp://host",
            "tcp://host:notaport",
            "tcp://:9000?timeout_ms=5",
            "tcp://host:1?bogus=1",
            "serial://dev/tty",
            "serial:///dev/tty?baud=0",
            "shm://",
            "local://somewhere",
        ] {
            assert!(
                matches!(TransportUri::parse(bad), Err(CortexError::InvalidUri { .. })),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn display_round_trips() {
        for uri in ["local://", "tcp://:7000", "tcp://10.0.0.2:7000?timeout_ms=100", "shm://x"] {
            let parsed = TransportUri::parse(uri).unwrap();
            assert_eq!(TransportUri::parse(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn roles_cannot_both_listen_or_both_dial() {
        let listen = TransportUri::parse("tcp://:7000").unwrap();
        let dial = TransportUri::parse("tcp://127.0.0.1:7000").unwrap();
        let t = Duration::from_millis(10);

        assert!(matches!(open(&listen, Role::Harness, t), Err(CortexError::InvalidUri { .. })));
        assert!(matches!(open(&dial, Role::Adapter, t), Err(CortexError::InvalidUri { .. })));
        assert!(matches!(
            open(&TransportUri::Local, Role::Harness, t),
            Err(CortexError::InvalidUri { .. })
        ));
    }
}
