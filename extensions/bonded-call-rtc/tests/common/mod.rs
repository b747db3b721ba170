#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bonded::{
    call::{
        Call, CallSession, CallStatus, ConnectionState, IceCandidate, IceServer, LocalStream,
        LocalTrack, MediaConstraints, MediaDevices, MediaError, MediaKind, PeerConnection,
        PeerTransport, RemoteTrack, SdpKind, SessionDescription, TransportEventKind,
        TransportEvents,
    },
    error::Error,
    sync::Mutex,
    ParticipantId,
};
use bonded_call_rtc::{
    pubsub::MemoryPubSub, routes, store::MemoryCallLog, Args, CallController, Config,
};
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(10);

// ------ devices ------

#[derive(Default)]
pub struct FakeDevices {
    failure: Mutex<Option<MediaError>>,
    acquired: Mutex<Vec<LocalStream>>,
}

impl FakeDevices {
    pub fn failing(error: MediaError) -> Self {
        let devices = Self::default();
        *devices.failure.lock() = Some(error);
        devices
    }

    pub fn acquired(&self) -> Vec<LocalStream> {
        self.acquired.lock().clone()
    }

    pub fn last(&self) -> Option<LocalStream> {
        self.acquired.lock().last().cloned()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        let mut tracks = vec![];
        if constraints.audio {
            tracks.push(LocalTrack::new(MediaKind::Audio, "fake mic"));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(MediaKind::Video, "fake camera"));
        }
        let stream = LocalStream::new(tracks);
        self.acquired.lock().push(stream.clone());
        Ok(stream)
    }
}

// ------ transport ------

/// Peer connections that find each other through the descriptions they exchange. Applying
/// an answer connects both ends and raises a remote track on each.
#[derive(Clone, Default)]
pub struct FakeNetwork {
    peers: Arc<Mutex<HashMap<Uuid, PeerRecord>>>,
}

struct PeerRecord {
    events: TransportEvents,
    tracks: Vec<(String, MediaKind)>,
    stream_id: String,
    remote_set: bool,
    applied: Vec<IceCandidate>,
    closed: bool,
}

impl FakeNetwork {
    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn open_connections(&self) -> usize {
        self.peers.lock().values().filter(|p| !p.closed).count()
    }

    /// every remote candidate accepted by any connection
    pub fn applied_candidates(&self) -> Vec<String> {
        self.peers
            .lock()
            .values()
            .flat_map(|p| p.applied.iter().map(|c| c.candidate.clone()))
            .collect()
    }

    pub fn local_candidate(id: Uuid) -> String {
        format!("candidate:{id} 1 udp 2122260223 10.0.0.2 50000 typ host")
    }

    /// reports `state` on every open connection
    pub fn set_state(&self, state: ConnectionState) {
        for peer in self.peers.lock().values().filter(|p| !p.closed) {
            peer.events.emit(TransportEventKind::StateChanged(state));
        }
    }
}

#[async_trait]
impl PeerTransport for FakeNetwork {
    async fn create_connection(
        &self,
        _ice_servers: &[IceServer],
        events: TransportEvents,
    ) -> Result<Box<dyn PeerConnection>, Error> {
        let id = events.connection_id();
        self.peers.lock().insert(
            id,
            PeerRecord {
                events,
                tracks: vec![],
                stream_id: Uuid::new_v4().to_string(),
                remote_set: false,
                applied: vec![],
                closed: false,
            },
        );
        Ok(Box::new(FakePeer {
            id,
            network: self.clone(),
        }))
    }
}

struct FakePeer {
    id: Uuid,
    network: FakeNetwork,
}

impl FakePeer {
    fn with<T>(&self, f: impl FnOnce(&mut PeerRecord) -> Result<T, Error>) -> Result<T, Error> {
        let mut peers = self.network.peers.lock();
        let record = peers
            .get_mut(&self.id)
            .ok_or_else(|| Error::PeerConnection("unknown connection".into()))?;
        if record.closed {
            return Err(Error::PeerConnection("connection is closed".into()));
        }
        f(record)
    }
}

fn connection_of(sdp: &SessionDescription) -> Result<Uuid, Error> {
    let id = sdp
        .sdp
        .split_whitespace()
        .last()
        .ok_or_else(|| Error::PeerConnection("bad sdp".into()))?;
    Ok(Uuid::parse_str(id)?)
}

fn remote_tracks(record: &PeerRecord) -> Vec<RemoteTrack> {
    record
        .tracks
        .iter()
        .map(|(id, kind)| RemoteTrack {
            id: id.clone(),
            stream_id: record.stream_id.clone(),
            kind: *kind,
        })
        .collect()
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&mut self, track: &LocalTrack) -> Result<(), Error> {
        self.with(|r| {
            r.tracks.push((track.id().to_string(), track.kind()));
            Ok(())
        })
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, Error> {
        let id = self.id;
        self.with(|_| Ok(SessionDescription::offer(format!("fake-offer {id}"))))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, Error> {
        let id = self.id;
        self.with(|r| {
            if !r.remote_set {
                return Err(Error::PeerConnection("no remote offer".into()));
            }
            Ok(SessionDescription::answer(format!("fake-answer {id}")))
        })
    }

    async fn set_local_description(&mut self, _sdp: SessionDescription) -> Result<(), Error> {
        let id = self.id;
        self.with(|r| {
            r.events.emit(TransportEventKind::LocalCandidate(IceCandidate {
                candidate: FakeNetwork::local_candidate(id),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
            Ok(())
        })
    }

    async fn set_remote_description(&mut self, sdp: SessionDescription) -> Result<(), Error> {
        let other = connection_of(&sdp)?;
        self.with(|r| {
            r.remote_set = true;
            Ok(())
        })?;
        if sdp.kind != SdpKind::Answer {
            return Ok(());
        }
        // media starts flowing once the caller has the answer
        let peers = self.network.peers.lock();
        let (own, remote) = match (peers.get(&self.id), peers.get(&other)) {
            (Some(own), Some(remote)) => (own, remote),
            _ => return Err(Error::PeerConnection("remote connection is gone".into())),
        };
        if remote.closed {
            return Ok(());
        }
        for track in remote_tracks(remote) {
            own.events.emit(TransportEventKind::RemoteTrack(track));
        }
        for track in remote_tracks(own) {
            remote.events.emit(TransportEventKind::RemoteTrack(track));
        }
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), Error> {
        self.with(|r| {
            if !r.remote_set {
                return Err(Error::PeerConnection(
                    "remote description is not set".into(),
                ));
            }
            r.applied.push(candidate);
            Ok(())
        })
    }

    async fn close(&mut self) -> Result<(), Error> {
        if let Some(record) = self.network.peers.lock().get_mut(&self.id) {
            record.closed = true;
        }
        Ok(())
    }
}

// ------ harness ------

pub struct Side {
    pub id: ParticipantId,
    pub controller: CallController,
    pub devices: Arc<FakeDevices>,
}

pub struct Pair {
    pub bus: MemoryPubSub,
    pub network: FakeNetwork,
    pub call_log: MemoryCallLog,
    pub topic: String,
    pub alice: Side,
    pub bob: Side,
}

pub fn id(s: &str) -> ParticipantId {
    s.parse().expect("valid id")
}

pub async fn side(
    own: &str,
    remote: &str,
    bus: &MemoryPubSub,
    network: &FakeNetwork,
    call_log: &MemoryCallLog,
    devices: FakeDevices,
) -> anyhow::Result<Side> {
    let devices = Arc::new(devices);
    let controller = CallController::new(Args {
        own_id: id(own),
        remote_id: id(remote),
        config: Config::default(),
        pubsub: Arc::new(bus.clone()),
        transport: Arc::new(network.clone()),
        devices: devices.clone(),
        call_log: Arc::new(call_log.clone()),
    })
    .await?;
    Ok(Side {
        id: id(own),
        controller,
        devices,
    })
}

/// alice and bob, both listening on their pair topic
pub async fn pair() -> anyhow::Result<Pair> {
    pair_with(FakeDevices::default(), FakeDevices::default()).await
}

pub async fn pair_with(alice: FakeDevices, bob: FakeDevices) -> anyhow::Result<Pair> {
    let bus = MemoryPubSub::new();
    let network = FakeNetwork::default();
    let call_log = MemoryCallLog::new();
    let alice = side("alice", "bob", &bus, &network, &call_log, alice).await?;
    let bob = side("bob", "alice", &bus, &network, &call_log, bob).await?;
    Ok(Pair {
        topic: routes::call_topic(&alice.id, &bob.id),
        bus,
        network,
        call_log,
        alice,
        bob,
    })
}

pub async fn wait_for_status(
    controller: &CallController,
    status: CallStatus,
) -> anyhow::Result<CallSession> {
    wait_for(controller, |s| s.status == status).await
}

pub async fn wait_for<F>(controller: &CallController, predicate: F) -> anyhow::Result<CallSession>
where
    F: Fn(&CallSession) -> bool,
{
    let mut rx = controller.subscribe();
    let session = tokio::time::timeout(WAIT, rx.wait_for(|s| predicate(s))).await??;
    Ok(session.clone())
}

/// alice calls bob and bob answers
pub async fn connected_pair(video: bool) -> anyhow::Result<Pair> {
    let mut pair = pair().await?;
    pair.alice.controller.start_call(video).await?;
    wait_for_status(&pair.bob.controller, CallStatus::Ringing).await?;
    pair.bob.controller.answer_call().await?;
    wait_for_status(&pair.alice.controller, CallStatus::Connected).await?;
    wait_for_status(&pair.bob.controller, CallStatus::Connected).await?;
    Ok(pair)
}
