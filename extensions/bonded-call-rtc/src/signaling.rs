use bonded::{
    call::{IceCandidate, SessionDescription},
    ParticipantId,
};
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Everything exchanged over the pair topic. Serialized as `{"event": .., "payload": {..}}`,
/// the envelope the web client uses for realtime broadcasts.
#[derive(Debug, Display, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum SignalingMessage {
    // sent first, by the caller
    #[display(fmt = "Offer")]
    Offer {
        from: ParticipantId,
        offer: SessionDescription,
        #[serde(rename = "isVideo", default)]
        is_video: bool,
    },
    // sent by the callee after accepting
    #[display(fmt = "Answer")]
    Answer {
        from: ParticipantId,
        answer: SessionDescription,
    },
    #[display(fmt = "IceCandidate")]
    IceCandidate {
        from: ParticipantId,
        candidate: IceCandidate,
    },
    #[display(fmt = "CallRejected")]
    CallRejected { from: ParticipantId },
    #[display(fmt = "CallEnded")]
    CallEnded { from: ParticipantId },
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    #[display(fmt = "offer")]
    Offer,
    #[display(fmt = "answer")]
    Answer,
    #[display(fmt = "ice-candidate")]
    IceCandidate,
    #[display(fmt = "call-rejected")]
    CallRejected,
    #[display(fmt = "call-ended")]
    CallEnded,
}

impl SignalKind {
    pub const ALL: [SignalKind; 5] = [
        SignalKind::Offer,
        SignalKind::Answer,
        SignalKind::IceCandidate,
        SignalKind::CallRejected,
        SignalKind::CallEnded,
    ];

    /// the broadcast event name
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::CallRejected => "call-rejected",
            SignalKind::CallEnded => "call-ended",
        }
    }
}

impl SignalingMessage {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalingMessage::Offer { .. } => SignalKind::Offer,
            SignalingMessage::Answer { .. } => SignalKind::Answer,
            SignalingMessage::IceCandidate { .. } => SignalKind::IceCandidate,
            SignalingMessage::CallRejected { .. } => SignalKind::CallRejected,
            SignalingMessage::CallEnded { .. } => SignalKind::CallEnded,
        }
    }

    pub fn sender(&self) -> &ParticipantId {
        match self {
            SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::IceCandidate { from, .. }
            | SignalingMessage::CallRejected { from }
            | SignalingMessage::CallEnded { from } => from,
        }
    }
}

pub mod routes {
    use bonded::ParticipantId;

    const CALL_PREFIX: &str = "call";

    /// one topic per unordered pair. both sides derive the same name without talking
    pub fn call_topic(a: &ParticipantId, b: &ParticipantId) -> String {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        format!("{CALL_PREFIX}-{first}-{second}")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bonded::call::SdpKind;

    fn id(s: &str) -> ParticipantId {
        s.parse().expect("valid id")
    }

    #[test]
    fn topic_is_order_independent() {
        let a = id("u1");
        let b = id("u2");
        assert_eq!(routes::call_topic(&a, &b), routes::call_topic(&b, &a));
        assert_eq!(routes::call_topic(&a, &b), "call-u1-u2");
    }

    #[test]
    fn topic_differs_per_pair() {
        let a = id("u1");
        let b = id("u2");
        let c = id("u3");
        assert_ne!(routes::call_topic(&a, &b), routes::call_topic(&a, &c));
    }

    #[test]
    fn offer_matches_web_envelope() -> anyhow::Result<()> {
        let msg = SignalingMessage::Offer {
            from: id("u1"),
            offer: SessionDescription::offer("v=0"),
            is_video: true,
        };
        let json = serde_json::to_value(&msg)?;
        assert_eq!(
            json,
            serde_json::json!({
                "event": "offer",
                "payload": {
                    "from": "u1",
                    "offer": {"type": "offer", "sdp": "v=0"},
                    "isVideo": true
                }
            })
        );
        Ok(())
    }

    #[test]
    fn decodes_web_candidate() -> anyhow::Result<()> {
        let json = serde_json::json!({
            "event": "ice-candidate",
            "payload": {
                "from": "u2",
                "candidate": {
                    "candidate": "candidate:0 1 UDP 2122252543 192.168.1.4 53421 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                }
            }
        });
        let msg: SignalingMessage = serde_json::from_value(json)?;
        assert_eq!(msg.kind(), SignalKind::IceCandidate);
        assert_eq!(msg.sender(), &id("u2"));
        Ok(())
    }

    #[test]
    fn decodes_bare_termination() -> anyhow::Result<()> {
        let msg: SignalingMessage =
            serde_json::from_str(r#"{"event":"call-ended","payload":{"from":"u9"}}"#)?;
        assert_eq!(msg, SignalingMessage::CallEnded { from: id("u9") });
        Ok(())
    }

    #[test]
    fn kind_matches_event_name() -> anyhow::Result<()> {
        for kind in SignalKind::ALL {
            assert_eq!(kind.to_string(), kind.event_name());
        }
        let answer = SignalingMessage::Answer {
            from: id("u1"),
            answer: SessionDescription {
                kind: SdpKind::Answer,
                sdp: "v=0".into(),
            },
        };
        let json = serde_json::to_value(&answer)?;
        assert_eq!(json["event"], answer.kind().event_name());
        Ok(())
    }
}
