//! Peer selection for layer-4 proxies.
//!
//! The server side of every connection is derived from one base template:
//! its destination is either the configured one or the client's original
//! destination, and its source port is either ephemeral, fixed, or mirrored
//! from the client.

use std::sync::Arc;

use interpose_core::Destination;
use interpose_endpoint::{EndpointError, EndpointTemplate, TemplateOverrides};
use interpose_relay::{ConnectionInfo, PeerPolicy};

/// Where the server side connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    /// The base template's destination.
    #[default]
    Static,
    /// Where the client was originally headed before interception.
    Transparent,
}

/// Local port of the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourcePort {
    #[default]
    Ephemeral,
    Fixed(u16),
    /// The client's own source port.
    Mirror,
}

#[derive(Debug, Clone)]
pub struct Layer4Policy {
    base: Arc<dyn EndpointTemplate>,
    target: Target,
    source: SourcePort,
}

impl Layer4Policy {
    pub fn new(base: Arc<dyn EndpointTemplate>) -> Self {
        Self {
            base,
            target: Target::Static,
            source: SourcePort::Ephemeral,
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_source(mut self, source: SourcePort) -> Self {
        self.source = source;
        self
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn source(&self) -> SourcePort {
        self.source
    }

    fn overrides(&self, conn: &ConnectionInfo) -> Result<TemplateOverrides, EndpointError> {
        let destination = match self.target {
            Target::Static => None,
            Target::Transparent => Some(original_destination(conn)?),
        };
        let source_port = match self.source {
            SourcePort::Ephemeral => None,
            SourcePort::Fixed(port) => Some(port),
            SourcePort::Mirror => match conn.peer {
                Some(peer) => Some(peer.port()),
                None => {
                    return Err(EndpointError::Config(format!(
                        "connection {} has no peer port to mirror",
                        conn.id
                    )));
                }
            },
        };
        Ok(TemplateOverrides {
            destination,
            source_port,
        })
    }
}

fn original_destination(conn: &ConnectionInfo) -> Result<Destination, EndpointError> {
    conn.destination.clone().ok_or_else(|| {
        EndpointError::Config(format!(
            "no original destination for connection {}; is the listener transparent?",
            conn.id
        ))
    })
}

impl PeerPolicy for Layer4Policy {
    fn peer_template(&self, conn: &ConnectionInfo) -> Result<Arc<dyn EndpointTemplate>, EndpointError> {
        let overrides = self.overrides(conn)?;
        if overrides.is_empty() {
            return Ok(self.base.clone());
        }
        self.base.with_overrides(&overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interpose_endpoint::{TcpTemplate, UnixAddress, UnixTemplate};
    use interpose_proto::CodecSpec;

    fn base() -> Arc<dyn EndpointTemplate> {
        Arc::new(TcpTemplate::new(Destination::new("127.0.0.1", 8080)))
    }

    fn conn(destination: Option<Destination>) -> ConnectionInfo {
        ConnectionInfo {
            id: 7,
            peer: Some("192.168.1.20:41000".parse().unwrap()),
            destination,
        }
    }

    #[test]
    fn test_static_target_keeps_base() {
        let policy = Layer4Policy::new(base());
        let t = policy
            .peer_template(&conn(Some(Destination::new("10.0.0.5", 9000))))
            .unwrap();
        assert_eq!(t.destination(), Some(&Destination::new("127.0.0.1", 8080)));
    }

    #[test]
    fn test_transparent_target_uses_original_destination() {
        let policy = Layer4Policy::new(base()).with_target(Target::Transparent);
        let t = policy
            .peer_template(&conn(Some(Destination::new("10.0.0.5", 9000))))
            .unwrap();
        assert_eq!(t.destination(), Some(&Destination::new("10.0.0.5", 9000)));
    }

    #[test]
    fn test_transparent_without_destination_fails() {
        let policy = Layer4Policy::new(base()).with_target(Target::Transparent);
        let err = policy.peer_template(&conn(None)).unwrap_err();
        assert_eq!(err.error_type(), interpose_core::ERROR_CONFIG);
    }

    #[test]
    fn test_mirror_without_peer_fails() {
        let policy = Layer4Policy::new(base()).with_source(SourcePort::Mirror);
        let info = ConnectionInfo {
            id: 1,
            peer: None,
            destination: None,
        };
        assert!(policy.peer_template(&info).is_err());
    }

    #[test]
    fn test_unix_base_rejects_retargeting() {
        let unix: Arc<dyn EndpointTemplate> = Arc::new(UnixTemplate {
            address: UnixAddress::new("/tmp/never-used.sock", false),
            codec: CodecSpec::Passthrough,
        });
        let policy = Layer4Policy::new(unix.clone());
        assert_eq!(policy.peer_template(&conn(None)).unwrap().kind(), "unix");

        let policy = Layer4Policy::new(unix).with_target(Target::Transparent);
        assert!(
            policy
                .peer_template(&conn(Some(Destination::new("10.0.0.5", 9000))))
                .is_err()
        );
    }
}
