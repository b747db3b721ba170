//! simple-webrtc
//! Implements [`PeerTransport`] on top of [webrtc-rs](https://github.com/webrtc-rs/webrtc).
//!
//! this module only negotiates the session and moves RTP packets. Turning captured samples into
//! RTP packets is the host's responsibility: every local track attached to a connection gets a
//! `TrackLocalStaticRTP`, available from [`RtcTransport::local_rtp_track`], which the capture
//! pipeline writes into. Received tracks are available from [`RtcTransport::remote_rtp_track`].
//!
//! WebRTC requires out of band signalling. Local ICE candidates, remote tracks and connection
//! state changes are reported through the [`TransportEvents`] handed to `create_connection`.
//!

use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use bonded::{
    call::{
        ConnectionState, IceCandidate, IceServer, LocalTrack, MediaKind, PeerConnection,
        PeerTransport, RemoteTrack, SessionDescription, TransportEventKind, TransportEvents,
    },
    error::Error,
    sync::RwLock,
};
use uuid::Uuid;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8},
        APIBuilder,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType},
        rtp_receiver::RTCRtpReceiver,
        RTCRtpTransceiver,
        rtp_sender::RTCRtpSender,
    },
    track::{track_local::track_local_static_rtp::TrackLocalStaticRTP, track_remote::TrackRemote},
};

type LocalTracks = Arc<RwLock<HashMap<String, Arc<TrackLocalStaticRTP>>>>;
type RemoteTracks = Arc<RwLock<HashMap<String, Arc<TrackRemote>>>>;

#[derive(Clone)]
pub struct RtcTransport {
    api: Arc<webrtc::api::API>,
    local_tracks: LocalTracks,
    remote_tracks: RemoteTracks,
}

impl RtcTransport {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            api: Arc::new(create_api()?),
            local_tracks: Default::default(),
            remote_tracks: Default::default(),
        })
    }

    /// the RTP sink for a local track, once the track is attached to a connection
    pub fn local_rtp_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticRTP>> {
        self.local_tracks.read().get(track_id).cloned()
    }

    /// the RTP source for a track received from the remote side
    pub fn remote_rtp_track(&self, track_id: &str) -> Option<Arc<TrackRemote>> {
        self.remote_tracks.read().get(track_id).cloned()
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_connection(
        &self,
        ice_servers: &[IceServer],
        events: TransportEvents,
    ) -> Result<Box<dyn PeerConnection>, Error> {
        let peer = RtcPeer::connect(self, ice_servers, events)
            .await
            .map_err(|e| Error::PeerConnection(format!("{e:#}")))?;
        Ok(Box::new(peer))
    }
}

/// reads incoming RTCP packets for a sender. the interceptors (NACK, reports) only run
/// while someone reads
struct RtcRtpManager {
    _sender: Arc<RTCRtpSender>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for RtcRtpManager {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct RtcPeer {
    connection: Arc<RTCPeerConnection>,
    stream_id: String,
    rtp_senders: HashMap<String, RtcRtpManager>,
    local_tracks: LocalTracks,
    remote_tracks: RemoteTracks,
    // the native description kept from create_offer/create_answer
    pending_local: Option<RTCSessionDescription>,
}

impl RtcPeer {
    async fn connect(
        transport: &RtcTransport,
        ice_servers: &[IceServer],
        events: TransportEvents,
    ) -> anyhow::Result<Self> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let connection = Arc::new(transport.api.new_peer_connection(config).await?);
        let connection_id = events.connection_id();

        let ch = events.clone();
        connection.on_peer_connection_state_change(Box::new(
            move |c: RTCPeerConnectionState| {
                log::info!("WebRTC connection state for {connection_id} has changed {c}");
                let state = match c {
                    RTCPeerConnectionState::Unspecified => None,
                    RTCPeerConnectionState::New => Some(ConnectionState::New),
                    RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                    RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                    RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                };
                if let Some(state) = state {
                    if !ch.emit(TransportEventKind::StateChanged(state)) {
                        log::debug!("state change for closed connection {connection_id}");
                    }
                }
                Box::pin(futures::future::ready(()))
            },
        ));

        let ch = events.clone();
        connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            if let Some(candidate) = c {
                match candidate.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        if !ch.emit(TransportEventKind::LocalCandidate(candidate)) {
                            log::debug!("ice candidate for closed connection {connection_id}");
                        }
                    }
                    Err(e) => log::error!("failed to serialize ice candidate: {e}"),
                }
            }
            Box::pin(futures::future::ready(()))
        }));

        let ch = events;
        let remote_tracks = transport.remote_tracks.clone();
        connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let ch = ch.clone();
                let remote_tracks = remote_tracks.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => MediaKind::Video,
                        _ => MediaKind::Audio,
                    };
                    let remote = RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    };
                    log::debug!("remote {} track {} added", remote.kind, remote.id);
                    remote_tracks.write().insert(remote.id.clone(), track);
                    if !ch.emit(TransportEventKind::RemoteTrack(remote)) {
                        log::debug!("track for closed connection {connection_id}");
                    }
                })
            },
        ));

        Ok(Self {
            connection,
            stream_id: Uuid::new_v4().to_string(),
            rtp_senders: HashMap::new(),
            local_tracks: transport.local_tracks.clone(),
            remote_tracks: transport.remote_tracks.clone(),
            pending_local: None,
        })
    }

    fn native(&mut self, sdp: SessionDescription) -> anyhow::Result<RTCSessionDescription> {
        if let Some(native) = self.pending_local.take() {
            if native.sdp == sdp.sdp {
                return Ok(native);
            }
        }
        // same {type, sdp} shape on both sides
        let value = serde_json::to_value(&sdp)?;
        serde_json::from_value(value).context("session description")
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "".to_owned(),
            rtcp_feedback: vec![],
        },
    }
}

fn to_description(native: &RTCSessionDescription) -> anyhow::Result<SessionDescription> {
    let value = serde_json::to_value(native)?;
    serde_json::from_value(value).context("session description")
}

fn map_err(e: anyhow::Error) -> Error {
    Error::PeerConnection(format!("{e:#}"))
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_track(&mut self, track: &LocalTrack) -> Result<(), Error> {
        if self.rtp_senders.contains_key(track.id()) {
            log::warn!("track {} already attached", track.id());
            return Ok(());
        }
        let rtp_track = Arc::new(TrackLocalStaticRTP::new(
            codec_for(track.kind()),
            track.id().to_string(),
            self.stream_id.clone(),
        ));
        let rtp_sender = self
            .connection
            .add_track(rtp_track.clone())
            .await
            .map_err(|e| Error::PeerConnection(e.to_string()))?;

        // Read incoming RTCP packets
        // Before these packets are returned they are processed by interceptors. For things
        // like NACK this needs to be called.
        let sender2 = rtp_sender.clone();
        let handle = tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender2.read(&mut rtcp_buf).await {}
            log::debug!("terminating rtp_sender thread");
        });
        self.rtp_senders.insert(
            track.id().to_string(),
            RtcRtpManager {
                _sender: rtp_sender,
                handle,
            },
        );
        self.local_tracks
            .write()
            .insert(track.id().to_string(), rtp_track);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, Error> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(|e| Error::PeerConnection(e.to_string()))?;
        let sdp = to_description(&offer).map_err(map_err)?;
        self.pending_local = Some(offer);
        Ok(sdp)
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, Error> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(|e| Error::PeerConnection(e.to_string()))?;
        let sdp = to_description(&answer).map_err(map_err)?;
        self.pending_local = Some(answer);
        Ok(sdp)
    }

    async fn set_local_description(&mut self, sdp: SessionDescription) -> Result<(), Error> {
        let native = self.native(sdp).map_err(map_err)?;
        // Note: this will start the gathering of ICE candidates
        self.connection
            .set_local_description(native)
            .await
            .map_err(|e| Error::PeerConnection(e.to_string()))
    }

    async fn set_remote_description(&mut self, sdp: SessionDescription) -> Result<(), Error> {
        let value = serde_json::to_value(&sdp)?;
        let native: RTCSessionDescription = serde_json::from_value(value)?;
        self.connection
            .set_remote_description(native)
            .await
            .map_err(|e| Error::PeerConnection(e.to_string()))
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), Error> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::PeerConnection(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), Error> {
        {
            let mut local_tracks = self.local_tracks.write();
            for id in self.rtp_senders.keys() {
                local_tracks.remove(id);
            }
        }
        self.rtp_senders.clear();
        self.remote_tracks.write().clear();
        self.connection
            .close()
            .await
            .map_err(|e| Error::PeerConnection(e.to_string()))
    }
}

// todo: try setting useinbandfec=0 instead of 1
fn create_api() -> anyhow::Result<webrtc::api::API> {
    let mut media = MediaEngine::default();

    media.register_codec(
        RTCRtpCodecParameters {
            capability: codec_for(MediaKind::Audio),
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    media.register_codec(
        RTCRtpCodecParameters {
            capability: codec_for(MediaKind::Video),
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    // Create a InterceptorRegistry. This is the user configurable RTP/RTCP Pipeline.
    // This provides NACKs, RTCP Reports and other features.
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;

    // Create the API object with the MediaEngine
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

#[cfg(test)]
mod test {
    use super::*;
    use bonded::call::SdpKind;
    use tokio::sync::mpsc;

    #[test]
    fn codecs_per_kind() {
        assert_eq!(codec_for(MediaKind::Audio).mime_type, MIME_TYPE_OPUS);
        assert_eq!(codec_for(MediaKind::Video).mime_type, MIME_TYPE_VP8);
    }

    #[tokio::test]
    async fn offer_lists_attached_tracks() -> anyhow::Result<()> {
        let transport = RtcTransport::new()?;
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pc = transport
            .create_connection(&[], TransportEvents::new(Uuid::new_v4(), tx))
            .await?;
        let mic = LocalTrack::new(MediaKind::Audio, "mic");
        pc.add_track(&mic).await?;
        assert!(transport.local_rtp_track(mic.id()).is_some());

        let offer = pc.create_offer().await?;
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));

        pc.close().await?;
        assert!(transport.local_rtp_track(mic.id()).is_none());
        Ok(())
    }
}
