//! The peer-to-peer transport the call controller drives. The shapes follow the WebRTC
//! primitives: a connection is created with a list of ICE servers, local tracks are
//! attached, descriptions and candidates are exchanged out of band, and the connection
//! reports remote tracks and state changes back through [`TransportEvents`].

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::media::{LocalTrack, RemoteTrack};
use crate::error::Error;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    #[display(fmt = "offer")]
    Offer,
    #[display(fmt = "answer")]
    Answer,
    #[display(fmt = "pranswer")]
    Pranswer,
    #[display(fmt = "rollback")]
    Rollback,
}

/// A session description as it travels over the signaling channel: `{"type": .., "sdp": ..}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// disconnected and failed both end the call. there is no reconnection attempt
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

/// Events raised by a peer connection
#[derive(Debug, Display, Clone)]
pub enum TransportEventKind {
    #[display(fmt = "LocalCandidate")]
    LocalCandidate(IceCandidate),
    #[display(fmt = "RemoteTrack")]
    RemoteTrack(RemoteTrack),
    #[display(fmt = "StateChanged({_0})")]
    StateChanged(ConnectionState),
}

#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub connection_id: Uuid,
    pub kind: TransportEventKind,
}

/// Handed to [`PeerTransport::create_connection`]; every event is tagged with the id of the
/// connection that raised it so stale events from a closed connection can be told apart.
#[derive(Clone)]
pub struct TransportEvents {
    connection_id: Uuid,
    ch: UnboundedSender<TransportEvent>,
}

impl TransportEvents {
    pub fn new(connection_id: Uuid, ch: UnboundedSender<TransportEvent>) -> Self {
        Self { connection_id, ch }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// returns false once the receiving side is gone
    pub fn emit(&self, kind: TransportEventKind) -> bool {
        self.ch
            .send(TransportEvent {
                connection_id: self.connection_id,
                kind,
            })
            .is_ok()
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn create_connection(
        &self,
        ice_servers: &[IceServer],
        events: TransportEvents,
    ) -> Result<Box<dyn PeerConnection>, Error>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&mut self, track: &LocalTrack) -> Result<(), Error>;
    async fn create_offer(&mut self) -> Result<SessionDescription, Error>;
    async fn create_answer(&mut self) -> Result<SessionDescription, Error>;
    async fn set_local_description(&mut self, sdp: SessionDescription) -> Result<(), Error>;
    async fn set_remote_description(&mut self, sdp: SessionDescription) -> Result<(), Error>;
    /// most transports refuse a candidate before the remote description is set
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), Error>;
    async fn close(&mut self) -> Result<(), Error>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn description_wire_format() -> anyhow::Result<()> {
        let sdp = SessionDescription::offer("v=0");
        let json = serde_json::to_value(&sdp)?;
        assert_eq!(json, serde_json::json!({"type": "offer", "sdp": "v=0"}));
        Ok(())
    }

    #[test]
    fn candidate_wire_format() -> anyhow::Result<()> {
        let json = serde_json::json!({
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "usernameFragment": null
        });
        let candidate: IceCandidate = serde_json::from_value(json)?;
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());
        Ok(())
    }
}
