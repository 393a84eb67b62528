//! Transport profiles and the codec chain selected for each connection.
//!
//! A [`TransportProfile`] is fixed when a server or client is built. The
//! role picks the side: [`ServerPipeline::select`] and
//! [`ClientPipeline::select`] each map a profile to exactly one chain,
//! which carries the limits its stages enforce and drives how the
//! connection is served.
//!
//! ```text
//! plain text  server/client : utf-8 codec -> marker framing
//! http        server        : http codec -> body aggregator -> chunked writer
//! websocket   server        : http codec -> upgrade on path -> text/close frames
//! websocket   client        : http client codec -> handshake -> frames -> marker framing
//! ```

use std::fmt;
use std::str::FromStr;

use crate::framing::FrameConfig;

/// Path the WebSocket upgrade is served on and requested at.
pub const WEBSOCKET_PATH: &str = "/websocket";

/// Wire format negotiated for a listener or outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProfile {
    /// UTF-8 text with begin/end markers around every message.
    PlainText,
    /// HTTP/1.1 requests whose aggregated body is one message.
    Http,
    /// HTTP upgrade to WebSocket, one message per text frame.
    WebSocket,
}

impl TransportProfile {
    /// Configuration name of the profile.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlainText => "plain_text",
            Self::Http => "http",
            Self::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for TransportProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportProfile {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain_text" | "plain-text" | "text" => Ok(Self::PlainText),
            "http" => Ok(Self::Http),
            "websocket" | "ws" => Ok(Self::WebSocket),
            _ => Err(PipelineError::UnknownProfile(s.to_string())),
        }
    }
}

/// Which end of the connection the pipeline serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Accepting side.
    Server,
    /// Connecting side.
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Server => "server",
            Self::Client => "client",
        })
    }
}

/// Wiring faults. These indicate a configuration defect, not a runtime condition.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The profile name is not one of the known profiles.
    #[error("unknown transport profile: {0:?}")]
    UnknownProfile(String),
    /// No pipeline exists for this profile/role combination.
    #[error("no {role} pipeline for the {profile} profile")]
    Unsupported {
        /// Requested profile.
        profile: TransportProfile,
        /// Requested role.
        role: Role,
    },
}

/// Limits enforced on every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineLimits {
    /// Plain-text bytes held while waiting for an end marker. Default: 1 MB.
    pub max_pending_frame_size: usize,
    /// Largest aggregated HTTP body or WebSocket message. Default: 64 KB.
    pub max_http_body_size: usize,
    /// Largest upgrade response the WebSocket client accepts. Default: 8 KB.
    pub max_handshake_response_size: usize,
    /// Writes queued for one connection before it is closed as a slow
    /// reader. Default: 1024.
    pub outbound_queue_capacity: usize,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            max_pending_frame_size: 1_048_576,
            max_http_body_size: 65_536,
            max_handshake_response_size: 8_192,
            outbound_queue_capacity: 1024,
        }
    }
}

impl PipelineLimits {
    fn frame(&self) -> FrameConfig {
        FrameConfig {
            max_pending_size: self.max_pending_frame_size,
        }
    }
}

/// Codec chain attached to accepted connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPipeline {
    /// Marker-framed UTF-8 text.
    PlainText {
        /// Framing limits.
        frame: FrameConfig,
    },
    /// HTTP server with body aggregation and chunked responses.
    Http {
        /// Aggregated body limit.
        max_body_size: usize,
    },
    /// HTTP server upgrading to WebSocket on a fixed path.
    WebSocket {
        /// Upgrade path.
        path: &'static str,
        /// Largest accepted message.
        max_message_size: usize,
    },
}

impl ServerPipeline {
    /// Select the server chain for `profile`. Every profile has one.
    pub fn select(profile: TransportProfile, limits: &PipelineLimits) -> Self {
        match profile {
            TransportProfile::PlainText => Self::PlainText {
                frame: limits.frame(),
            },
            TransportProfile::Http => Self::Http {
                max_body_size: limits.max_http_body_size,
            },
            TransportProfile::WebSocket => Self::WebSocket {
                path: WEBSOCKET_PATH,
                max_message_size: limits.max_http_body_size,
            },
        }
    }

    /// The profile this chain implements.
    pub fn profile(&self) -> TransportProfile {
        match self {
            Self::PlainText { .. } => TransportProfile::PlainText,
            Self::Http { .. } => TransportProfile::Http,
            Self::WebSocket { .. } => TransportProfile::WebSocket,
        }
    }

    /// Reassembly limits. Chains delimited by their transport get the defaults.
    pub fn frame_config(&self) -> FrameConfig {
        match self {
            Self::PlainText { frame } => frame.clone(),
            Self::Http { .. } | Self::WebSocket { .. } => FrameConfig::default(),
        }
    }
}

/// Codec chain attached to outbound connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPipeline {
    /// Marker-framed UTF-8 text.
    PlainText {
        /// Framing limits.
        frame: FrameConfig,
    },
    /// WebSocket client driving the upgrade handshake itself.
    WebSocket {
        /// Upgrade path.
        path: &'static str,
        /// Largest accepted handshake response.
        max_response_size: usize,
        /// Framing limits for reassembling inbound text frames.
        frame: FrameConfig,
    },
}

impl ClientPipeline {
    /// Select the client chain for `profile`. HTTP has no client side.
    pub fn select(profile: TransportProfile, limits: &PipelineLimits) -> Result<Self, PipelineError> {
        match profile {
            TransportProfile::PlainText => Ok(Self::PlainText {
                frame: limits.frame(),
            }),
            TransportProfile::WebSocket => Ok(Self::WebSocket {
                path: WEBSOCKET_PATH,
                max_response_size: limits.max_handshake_response_size,
                frame: limits.frame(),
            }),
            TransportProfile::Http => Err(PipelineError::Unsupported {
                profile,
                role: Role::Client,
            }),
        }
    }

    /// The profile this chain implements.
    pub fn profile(&self) -> TransportProfile {
        match self {
            Self::PlainText { .. } => TransportProfile::PlainText,
            Self::WebSocket { .. } => TransportProfile::WebSocket,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_same_limits_for_both_roles() {
        let limits = PipelineLimits::default();
        let server = ServerPipeline::select(TransportProfile::PlainText, &limits);
        let client = ClientPipeline::select(TransportProfile::PlainText, &limits).unwrap();
        assert_eq!(
            client,
            ClientPipeline::PlainText {
                frame: server.frame_config()
            }
        );
        assert_eq!(server.profile(), TransportProfile::PlainText);
        assert_eq!(client.profile(), TransportProfile::PlainText);
    }

    #[test]
    fn test_http_server_aggregates_64k() {
        let pipeline = ServerPipeline::select(TransportProfile::Http, &PipelineLimits::default());
        assert_eq!(pipeline, ServerPipeline::Http { max_body_size: 65_536 });
    }

    #[test]
    fn test_websocket_server_upgrades_on_fixed_path() {
        let pipeline =
            ServerPipeline::select(TransportProfile::WebSocket, &PipelineLimits::default());
        assert_eq!(
            pipeline,
            ServerPipeline::WebSocket {
                path: "/websocket",
                max_message_size: 65_536
            }
        );
        assert_eq!(pipeline.profile(), TransportProfile::WebSocket);
    }

    #[test]
    fn test_websocket_client_uses_smaller_bound() {
        let pipeline =
            ClientPipeline::select(TransportProfile::WebSocket, &PipelineLimits::default())
                .unwrap();
        assert!(matches!(
            pipeline,
            ClientPipeline::WebSocket {
                path: "/websocket",
                max_response_size: 8_192,
                ..
            }
        ));
    }

    #[test]
    fn test_http_client_is_rejected() {
        let result = ClientPipeline::select(TransportProfile::Http, &PipelineLimits::default());
        assert!(matches!(
            result,
            Err(PipelineError::Unsupported {
                profile: TransportProfile::Http,
                role: Role::Client
            })
        ));
    }

    #[test]
    fn test_custom_limits_flow_into_chains() {
        let limits = PipelineLimits {
            max_pending_frame_size: 10,
            max_http_body_size: 100,
            max_handshake_response_size: 1000,
            ..Default::default()
        };
        let plain = ServerPipeline::select(TransportProfile::PlainText, &limits);
        assert_eq!(
            plain,
            ServerPipeline::PlainText {
                frame: FrameConfig {
                    max_pending_size: 10
                }
            }
        );
        let http = ServerPipeline::select(TransportProfile::Http, &limits);
        assert_eq!(http, ServerPipeline::Http { max_body_size: 100 });
        let ws = ClientPipeline::select(TransportProfile::WebSocket, &limits).unwrap();
        assert!(matches!(
            ws,
            ClientPipeline::WebSocket {
                max_response_size: 1000,
                frame: FrameConfig {
                    max_pending_size: 10
                },
                ..
            }
        ));
    }

    #[test]
    fn test_transport_delimited_chains_use_default_framing() {
        let limits = PipelineLimits {
            max_pending_frame_size: 10,
            ..Default::default()
        };
        let ws = ServerPipeline::select(TransportProfile::WebSocket, &limits);
        assert_eq!(ws.frame_config(), FrameConfig::default());
    }

    #[test]
    fn test_profile_parsing() {
        assert_eq!(
            "plain_text".parse::<TransportProfile>().unwrap(),
            TransportProfile::PlainText
        );
        assert_eq!(
            "HTTP".parse::<TransportProfile>().unwrap(),
            TransportProfile::Http
        );
        assert_eq!(
            " websocket ".parse::<TransportProfile>().unwrap(),
            TransportProfile::WebSocket
        );
    }

    #[test]
    fn test_unknown_profile_fails_loudly() {
        let result = "zlib".parse::<TransportProfile>();
        assert!(matches!(result, Err(PipelineError::UnknownProfile(ref p)) if p == "zlib"));
    }

    #[test]
    fn test_profile_display_roundtrips() {
        for profile in [
            TransportProfile::PlainText,
            TransportProfile::Http,
            TransportProfile::WebSocket,
        ] {
            assert_eq!(profile.to_string().parse::<TransportProfile>().unwrap(), profile);
        }
    }
}
