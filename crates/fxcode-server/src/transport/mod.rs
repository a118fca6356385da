//! Socket acceptance: TCP listener, HTTP upgrade and the connection query.

pub mod websocket;

pub use websocket::{accept_upgrade, start_listener, UpgradedConnection};

use fxcode_core::{FxError, FxResult};

/// Parameters a client passes on the upgrade request's query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionQuery {
    pub reconnection_token: String,
    pub reconnection: bool,
    /// Frames travel raw on the socket instead of inside WebSocket messages.
    pub skip_websocket_frames: bool,
    /// Workspace path hint for the initial load.
    pub path: Option<String>,
}

impl ConnectionQuery {
    pub fn parse(query: &str) -> FxResult<Self> {
        let mut token = None;
        let mut reconnection = false;
        let mut skip_websocket_frames = false;
        let mut path = None;

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "reconnectionToken" => token = Some(value.into_owned()),
                "reconnection" => reconnection = value == "true",
                "skipWebSocketFrames" => skip_websocket_frames = value == "true",
                "path" => path = Some(value.into_owned()),
                _ => {}
            }
        }

        let reconnection_token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| FxError::Upgrade("missing reconnectionToken".into()))?;
        Ok(Self {
            reconnection_token,
            reconnection,
            skip_websocket_frames,
            path,
        })
    }
}
