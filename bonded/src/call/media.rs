//! Local and remote media as the call core sees it. Capturing and rendering samples is the
//! job of the host runtime; the core only needs to hold the tracks, flip their enabled flag
//! and stop them when a call is torn down.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[display(fmt = "audio")]
    Audio,
    #[display(fmt = "video")]
    Video,
}

/// What to ask the device for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    /// audio is always requested. video only when asked for
    pub fn call(video: bool) -> Self {
        Self { audio: true, video }
    }
}

/// Reasons a device could not hand out a stream. Each kind maps to its own user message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Microphone/camera permission denied. Please allow access in your settings.")]
    PermissionDenied,
    #[error("No microphone/camera found on this device.")]
    DeviceNotFound,
    #[error("Microphone/camera is already in use by another app.")]
    DeviceBusy,
    #[error("This environment does not support calling.")]
    UnsupportedEnvironment,
    #[error("Could not access microphone/camera: {0}")]
    Other(String),
}

impl MediaError {
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

/// Host-provided access to capture devices.
#[async_trait]
pub trait MediaDevices: Send + Sync + 'static {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError>;
}

struct TrackInner {
    id: String,
    kind: MediaKind,
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
}

/// A captured track. Clones share state, so the capture pipeline and the call controller see
/// the same enabled/live flags.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// a disabled track stays attached to the connection but carries silence/black frames
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// releases the device. cannot be undone
    pub fn stop(&self) {
        self.inner.live.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks_of(MediaKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks_of(MediaKind::Video)
    }

    /// flips every track of the given kind and returns the new enabled flag
    /// of the first one, if any
    pub fn toggle(&self, kind: MediaKind) -> Option<bool> {
        let mut result = None;
        for track in self.tracks_of(kind) {
            let enabled = !track.is_enabled();
            track.set_enabled(enabled);
            result.get_or_insert(enabled);
        }
        result
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|t| !t.is_live())
    }
}

/// Description of a track received from the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

/// Populated by the transport. Read-only for the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStream {
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn add_track(&mut self, track: RemoteTrack) {
        if !self.tracks.iter().any(|t| t.id == track.id) {
            self.tracks.push(track);
        }
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn stream() -> LocalStream {
        LocalStream::new(vec![
            LocalTrack::new(MediaKind::Audio, "mic"),
            LocalTrack::new(MediaKind::Video, "cam"),
        ])
    }

    #[test]
    fn toggle_only_touches_one_kind() {
        let stream = stream();
        assert_eq!(stream.toggle(MediaKind::Audio), Some(false));
        assert!(stream.audio_tracks().all(|t| !t.is_enabled()));
        assert!(stream.video_tracks().all(|t| t.is_enabled()));
        assert_eq!(stream.toggle(MediaKind::Audio), Some(true));
        assert!(stream.audio_tracks().all(|t| t.is_enabled()));
    }

    #[test]
    fn toggle_without_tracks() {
        let stream = LocalStream::new(vec![LocalTrack::new(MediaKind::Audio, "mic")]);
        assert_eq!(stream.toggle(MediaKind::Video), None);
    }

    #[test]
    fn stop_is_shared_between_clones() {
        let stream = stream();
        let copy = stream.clone();
        assert!(!copy.is_stopped());
        stream.stop();
        assert!(copy.is_stopped());
    }

    #[test]
    fn error_messages_are_distinct() {
        let kinds = [
            MediaError::PermissionDenied,
            MediaError::DeviceNotFound,
            MediaError::DeviceBusy,
            MediaError::UnsupportedEnvironment,
        ];
        let mut messages: Vec<String> = kinds.iter().map(|k| k.user_message()).collect();
        messages.sort();
        messages.dedup();
        assert_eq!(messages.len(), kinds.len());
    }

    #[test]
    fn remote_stream_ignores_duplicate_tracks() {
        let mut remote = RemoteStream::default();
        let track = RemoteTrack {
            id: "t1".into(),
            stream_id: "s1".into(),
            kind: MediaKind::Audio,
        };
        remote.add_track(track.clone());
        remote.add_track(track);
        assert_eq!(remote.tracks().len(), 1);
        assert!(remote.has_kind(MediaKind::Audio));
        assert!(!remote.has_kind(MediaKind::Video));
    }
}
