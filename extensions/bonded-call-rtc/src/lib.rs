//! Call signaling for Bonded over a realtime pub/sub service and WebRTC.
//!
//! [`CallController`] implements [`bonded::call::Call`] for the call between the local user
//! and one remote participant. It is wired to its collaborators through traits, so the same
//! controller runs against the hosted services ([`pubsub::RealtimeClient`],
//! [`store::RestCallLog`], [`simple_webrtc::RtcTransport`]) or in-process doubles
//! ([`pubsub::MemoryPubSub`], [`store::MemoryCallLog`]).

pub mod channel;
pub mod config;
mod controller;
mod notify_wrapper;
pub mod pubsub;
pub mod signaling;
pub mod simple_webrtc;
pub mod store;

pub use channel::{ChannelHandle, ChannelSlot};
pub use config::Config;
pub use controller::{Args, CallController};
pub use signaling::{routes, SignalKind, SignalingMessage};
