use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::{
    media::{LocalStream, RemoteStream},
    transport::SessionDescription,
};
use crate::identity::ParticipantId;

#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    #[default]
    #[display(fmt = "idle")]
    Idle,
    #[display(fmt = "calling")]
    Calling,
    #[display(fmt = "ringing")]
    Ringing,
    #[display(fmt = "connected")]
    Connected,
    #[display(fmt = "ended")]
    Ended,
}

/// An offer that is waiting for the user to answer or reject it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub from: ParticipantId,
    pub offer: SessionDescription,
    pub is_video: bool,
}

/// Snapshot of the live call, rendered by the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    pub own_id: ParticipantId,
    pub remote_id: ParticipantId,
    pub status: CallStatus,
    pub is_video: bool,
    pub is_muted: bool,
    pub is_camera_off: bool,
    /// seconds since the remote media arrived
    pub duration: u64,
    pub local_stream: Option<LocalStream>,
    pub remote_stream: Option<RemoteStream>,
    pub incoming: Option<IncomingCall>,
    pub error: Option<String>,
}

impl CallSession {
    pub fn new(own_id: ParticipantId, remote_id: ParticipantId) -> Self {
        Self {
            own_id,
            remote_id,
            status: CallStatus::Idle,
            is_video: false,
            is_muted: false,
            is_camera_off: false,
            duration: 0,
            local_stream: None,
            remote_stream: None,
            incoming: None,
            error: None,
        }
    }

    /// drops everything call specific but keeps identities and the last error
    pub fn reset(&mut self, status: CallStatus) {
        self.status = status;
        self.is_video = false;
        self.is_muted = false;
        self.is_camera_off = false;
        self.duration = 0;
        self.local_stream = None;
        self.remote_stream = None;
        self.incoming = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::call::media::{LocalTrack, MediaKind};

    #[test]
    fn reset_keeps_error() -> anyhow::Result<()> {
        let mut session = CallSession::new("a".parse()?, "b".parse()?);
        session.status = CallStatus::Connected;
        session.duration = 4;
        session.is_muted = true;
        session.local_stream = Some(LocalStream::new(vec![LocalTrack::new(
            MediaKind::Audio,
            "mic",
        )]));
        session.error = Some("boom".into());

        session.reset(CallStatus::Ended);
        assert_eq!(session.status, CallStatus::Ended);
        assert_eq!(session.duration, 0);
        assert!(!session.is_muted);
        assert!(session.local_stream.is_none());
        assert_eq!(session.error.as_deref(), Some("boom"));
        Ok(())
    }
}
