//! Errors shared by the call core and its extensions.

use thiserror::Error;

use crate::call::media::MediaError;

#[derive(Error, Debug)]
pub enum Error {
    //Identity Errors
    #[error("Participant identity cannot be empty")]
    InvalidParticipantId,

    //Call Errors
    #[error("CallNotInProgress")]
    CallNotInProgress,
    #[error("CallAlreadyInProgress")]
    CallAlreadyInProgress,
    #[error("No incoming call to answer or reject")]
    NoIncomingCall,
    #[error("Operation is not allowed while the call is {status}")]
    InvalidCallState { status: crate::call::CallStatus },
    #[error("{0}")]
    Media(#[from] MediaError),
    #[error("Call controller is no longer running")]
    ControllerUnavailable,

    //Signaling Errors
    #[error("Signaling channel is closed")]
    ChannelClosed,
    #[error("FailedToSendSignal: {_0}")]
    FailedToSendSignal(String),

    //Transport Errors
    #[error("Peer connection failed: {_0}")]
    PeerConnection(String),

    //Call Log Errors
    #[error("Call log store failed: {_0}")]
    CallLog(String),

    //Config Errors
    #[error("Invalid configuration: {_0}")]
    InvalidConfig(String),

    //Misc
    #[error("{0}")]
    OtherWithContext(String),
    #[error("Sender Channel Unavailable")]
    SenderChannelUnavailable,
    #[error("Receiver Channel Unavailable")]
    ReceiverChannelUnavailable,
    #[error("{0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("{0}")]
    TomlError(#[from] toml::de::Error),
    #[error("{0}")]
    UuidError(#[from] uuid::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
    #[error("{0}")]
    IoError(#[from] std::io::Error),
}
