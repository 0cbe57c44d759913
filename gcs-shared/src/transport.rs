//! Transport types for host-guest communication.

use std::path::PathBuf;

/// Transport mechanism between the agent and the host.
///
/// A transport names one endpoint. Per-stream endpoints (stdio, 9p shares)
/// are derived from it with [`Transport::with_port`], keeping the same
/// connection kind.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Transport {
    /// TCP transport on the loopback interface
    Tcp { port: u16 },

    /// Unix socket transport
    Unix { socket_path: PathBuf },

    /// Vsock transport to the host CID
    Vsock { port: u32 },
}

impl Transport {
    pub fn tcp(port: u16) -> Self {
        Self::Tcp { port }
    }

    pub fn unix(socket_path: PathBuf) -> Self {
        Self::Unix { socket_path }
    }

    pub fn vsock(port: u32) -> Self {
        Self::Vsock { port }
    }

    /// Endpoint of the same kind for a host-assigned port.
    ///
    /// Unix sockets have no ports, so the port becomes a suffix of the
    /// socket path: `/run/host.sock` + 5 → `/run/host.sock.5`.
    pub fn with_port(&self, port: u32) -> Result<Self, String> {
        match self {
            Transport::Tcp { .. } => u16::try_from(port)
                .map(Self::tcp)
                .map_err(|_| format!("port {} out of range for TCP", port)),
            Transport::Unix { socket_path } => {
                let mut path = socket_path.clone().into_os_string();
                path.push(format!(".{}", port));
                Ok(Self::unix(PathBuf::from(path)))
            }
            Transport::Vsock { .. } => Ok(Self::vsock(port)),
        }
    }

    pub fn to_uri(&self) -> String {
        match self {
            Transport::Tcp { port } => format!("tcp://127.0.0.1:{}", port),
            Transport::Unix { socket_path } => format!("unix://{}", socket_path.display()),
            Transport::Vsock { port } => format!("vsock://{}", port),
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self, String> {
        if let Some(rest) = uri.strip_prefix("tcp://") {
            let port = rest
                .rsplit_once(':')
                .map(|(_, port)| port)
                .ok_or_else(|| format!("invalid TCP URI '{}': missing port", uri))?
                .parse::<u16>()
                .map_err(|e| format!("invalid TCP port in '{}': {}", uri, e))?;
            Ok(Self::tcp(port))
        } else if let Some(path) = uri.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(format!("invalid unix URI '{}': missing path", uri));
            }
            Ok(Self::unix(PathBuf::from(path)))
        } else if let Some(port_str) = uri.strip_prefix("vsock://") {
            let port = port_str
                .parse::<u32>()
                .map_err(|e| format!("invalid vsock port in '{}': {}", uri, e))?;
            Ok(Self::vsock(port))
        } else {
            Err(format!(
                "invalid transport URI '{}': expected tcp://, unix://, or vsock://",
                uri
            ))
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_uri(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uris() {
        assert_eq!(Transport::from_uri("vsock://2696"), Ok(Transport::vsock(2696)));
        assert_eq!(
            "tcp://127.0.0.1:8080".parse::<Transport>(),
            Ok(Transport::tcp(8080))
        );
        assert_eq!(
            Transport::from_uri("unix:///run/host.sock"),
            Ok(Transport::unix(PathBuf::from("/run/host.sock")))
        );
        assert!(Transport::from_uri("http://example").is_err());
        assert!(Transport::from_uri("unix://").is_err());
    }

    #[test]
    fn test_with_port_keeps_kind() {
        assert_eq!(Transport::vsock(0).with_port(109), Ok(Transport::vsock(109)));
        assert_eq!(Transport::tcp(1).with_port(9000), Ok(Transport::tcp(9000)));
        assert!(Transport::tcp(1).with_port(70_000).is_err());
        assert_eq!(
            Transport::unix(PathBuf::from("/run/host.sock")).with_port(5),
            Ok(Transport::unix(PathBuf::from("/run/host.sock.5")))
        );
    }

    #[test]
    fn test_display_round_trips() {
        let t = Transport::unix(PathBuf::from("/tmp/a.sock"));
        assert_eq!(t.to_string().parse::<Transport>(), Ok(t));
    }
}
