//! One-to-one audio/video calls. It should handle the following:
//! - negotiating a peer-to-peer session with the remote participant over a signaling topic
//! - acquiring and releasing local media
//! - reporting the call state to the UI
//! - keeping a history row for every call attempt
//!
use async_trait::async_trait;
use derive_more::Display;
use futures::stream::BoxStream;

pub mod call_log;
pub mod call_state;
pub mod media;
pub mod transport;

pub use call_log::{
    CallLogId, CallLogRecord, CallLogStatus, CallLogStore, CallLogUpdate, NewCallLog,
};
pub use call_state::{CallSession, CallStatus, IncomingCall};
pub use media::{
    LocalStream, LocalTrack, MediaConstraints, MediaDevices, MediaError, MediaKind, RemoteStream,
    RemoteTrack,
};
pub use transport::{
    ConnectionState, IceCandidate, IceServer, PeerConnection, PeerTransport, SdpKind,
    SessionDescription, TransportEvent, TransportEventKind, TransportEvents,
};

use crate::{error::Error, identity::ParticipantId};

/// Control surface of a call between the local user and one remote participant.
/// Only one call may be active at a time.
#[async_trait]
pub trait Call: Send + Sync {
    // ------ Misc ------
    /// The event stream notifies the UI of call related events
    async fn get_event_stream(&self) -> Result<CallEventStream, Error>;

    /// current snapshot of the call
    async fn session(&self) -> Result<CallSession, Error>;

    // ------ Create/Join a call ------

    /// acquire media and dial the remote participant.
    /// fails if a call is already in progress
    async fn start_call(&mut self, video: bool) -> Result<(), Error>;
    /// accept the ringing call. the offer and the media kind come from the ringing state
    async fn answer_call(&mut self) -> Result<(), Error>;
    /// decline the ringing call, or withdraw an own dial that has not been answered yet
    async fn reject_call(&mut self) -> Result<(), Error>;
    /// end/cancel the current call
    async fn end_call(&mut self) -> Result<(), Error>;

    // ------ Media controls ------

    /// returns true if the microphone is now muted
    async fn toggle_mute(&mut self) -> Result<bool, Error>;
    /// returns true if the camera is now off
    async fn toggle_camera(&mut self) -> Result<bool, Error>;

    /// dismiss the last error without touching the call
    async fn clear_error(&mut self) -> Result<(), Error>;
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// ended by the local user
    #[display(fmt = "hang up")]
    HangUp,
    /// the remote side sent call-ended
    #[display(fmt = "remote hang up")]
    RemoteHangUp,
    /// the remote side declined the call
    #[display(fmt = "rejected")]
    Rejected,
    /// the peer connection was lost
    #[display(fmt = "connection lost")]
    ConnectionLost,
}

/// Drives the UI
#[derive(Debug, Display, Clone, PartialEq)]
pub enum CallEventKind {
    #[display(fmt = "StatusChanged {status}")]
    StatusChanged { status: CallStatus },
    /// A call has been offered
    #[display(fmt = "IncomingCall from {from}")]
    IncomingCall { from: ParticipantId, is_video: bool },
    /// media from the remote side is flowing
    #[display(fmt = "RemoteStreamAdded")]
    RemoteStreamAdded { stream: RemoteStream },
    #[display(fmt = "CallEnded ({reason})")]
    CallEnded { reason: EndReason, duration: u64 },
    #[display(fmt = "Error: {message}")]
    Error { message: String },
}

pub struct CallEventStream(pub BoxStream<'static, CallEventKind>);

impl core::ops::Deref for CallEventStream {
    type Target = BoxStream<'static, CallEventKind>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for CallEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
