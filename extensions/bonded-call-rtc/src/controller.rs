//! The call session controller. One actor task per controller owns the session, the local
//! media, the peer connection and the channel slot. Commands, signaling messages, transport
//! events and timers are processed one at a time, each source in arrival order.

use std::{pin::Pin, sync::Arc};

use async_trait::async_trait;
use bonded::{
    call::{
        Call, CallEventKind, CallEventStream, CallLogStatus, CallLogStore, CallLogUpdate,
        CallSession, CallStatus, EndReason, IceCandidate, IceServer, IncomingCall, LocalStream,
        MediaConstraints, MediaDevices, MediaKind, NewCallLog, PeerConnection, PeerTransport,
        RemoteTrack, SessionDescription, TransportEvent, TransportEventKind, TransportEvents,
    },
    error::Error,
    ParticipantId,
};
use chrono::Utc;
use tokio::{
    sync::{
        broadcast,
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, watch, Notify,
    },
    time::{Instant, Interval, Sleep},
};
use uuid::Uuid;

use crate::{
    channel::ChannelSlot,
    config::Config,
    notify_wrapper::NotifyWrapper,
    pubsub::PubSub,
    signaling::{routes, SignalKind, SignalingMessage},
    store::CallLogWriter,
};

enum Cmd {
    StartCall {
        video: bool,
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    AnswerCall {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    RejectCall {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    EndCall {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    ToggleMute {
        rsp: oneshot::Sender<Result<bool, Error>>,
    },
    ToggleCamera {
        rsp: oneshot::Sender<Result<bool, Error>>,
    },
    ClearError {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
}

pub struct Args {
    pub own_id: ParticipantId,
    pub remote_id: ParticipantId,
    pub config: Config,
    pub pubsub: Arc<dyn PubSub>,
    pub transport: Arc<dyn PeerTransport>,
    pub devices: Arc<dyn MediaDevices>,
    pub call_log: Arc<dyn CallLogStore>,
}

/// Handle to the call between the local user and one remote participant. Clones share
/// the same actor; the actor stops, ending any live call, when the last clone is dropped.
#[derive(Clone)]
pub struct CallController {
    ch: UnboundedSender<Cmd>,
    ui_event_ch: broadcast::Sender<CallEventKind>,
    session_rx: watch::Receiver<CallSession>,
    // when CallController gets cloned, NotifyWrapper doesn't get cloned.
    // when NotifyWrapper finally gets dropped, the actor is told to quit
    notify: Arc<NotifyWrapper>,
}

impl CallController {
    /// starts listening on the pair topic, so an incoming offer can ring right away
    pub async fn new(args: Args) -> Result<Self, Error> {
        let Args {
            own_id,
            remote_id,
            config,
            pubsub,
            transport,
            devices,
            call_log,
        } = args;
        config.validate()?;
        if own_id == remote_id {
            return Err(Error::OtherWithContext(
                "own and remote participant are the same".into(),
            ));
        }

        let (ui_event_ch, _rx) = broadcast::channel(1024);
        let session = CallSession::new(own_id.clone(), remote_id.clone());
        let (session_tx, session_rx) = watch::channel(session.clone());
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (channel_lost_tx, channel_lost_rx) = mpsc::unbounded_channel();

        let mut actor = Actor {
            topic: routes::call_topic(&own_id, &remote_id),
            channel: ChannelSlot::new(pubsub, config.subscribe_timeout()),
            own_id,
            remote_id,
            config,
            transport,
            devices,
            call_log,
            signal_tx,
            transport_tx,
            channel_lost_tx,
            session,
            reported_status: CallStatus::Idle,
            session_tx,
            ui_event_ch: ui_event_ch.clone(),
            phase: Phase::Idle,
            link: None,
            call_log_writer: None,
            ticker: None,
            settle: None,
        };
        actor.open_channel().await?;

        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let notify = Arc::new(Notify::new());
        let notify2 = notify.clone();
        tokio::spawn(async move {
            run(actor, cmd_rx, signal_rx, transport_rx, channel_lost_rx, notify2).await;
        });

        Ok(Self {
            ch: tx,
            ui_event_ch,
            session_rx,
            notify: Arc::new(NotifyWrapper { notify }),
        })
    }

    /// snapshots, updated on every change
    pub fn subscribe(&self) -> watch::Receiver<CallSession> {
        self.session_rx.clone()
    }

    async fn request<T>(
        &self,
        cmd: impl FnOnce(oneshot::Sender<Result<T, Error>>) -> Cmd,
    ) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(cmd(tx))
            .map_err(|_| Error::ControllerUnavailable)?;
        rx.await.map_err(|_| Error::ControllerUnavailable)?
    }
}

#[async_trait]
impl Call for CallController {
    async fn get_event_stream(&self) -> Result<CallEventStream, Error> {
        let mut rx = self.ui_event_ch.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        Ok(CallEventStream(Box::pin(stream)))
    }

    async fn session(&self) -> Result<CallSession, Error> {
        Ok(self.session_rx.borrow().clone())
    }

    async fn start_call(&mut self, video: bool) -> Result<(), Error> {
        self.request(|rsp| Cmd::StartCall { video, rsp }).await
    }

    async fn answer_call(&mut self) -> Result<(), Error> {
        self.request(|rsp| Cmd::AnswerCall { rsp }).await
    }

    async fn reject_call(&mut self) -> Result<(), Error> {
        self.request(|rsp| Cmd::RejectCall { rsp }).await
    }

    async fn end_call(&mut self) -> Result<(), Error> {
        self.request(|rsp| Cmd::EndCall { rsp }).await
    }

    async fn toggle_mute(&mut self) -> Result<bool, Error> {
        self.request(|rsp| Cmd::ToggleMute { rsp }).await
    }

    async fn toggle_camera(&mut self) -> Result<bool, Error> {
        self.request(|rsp| Cmd::ToggleCamera { rsp }).await
    }

    async fn clear_error(&mut self) -> Result<(), Error> {
        self.request(|rsp| Cmd::ClearError { rsp }).await
    }
}

/// Finer grained than the public status: ringing covers both the unanswered offer and the
/// answered call that has no media yet.
enum Phase {
    Idle,
    /// offer sent, waiting for the answer and the remote media
    Dialing,
    /// remote offer waiting for the user. candidates for it are held here
    Incoming {
        offer: SessionDescription,
        is_video: bool,
        candidates: Vec<IceCandidate>,
    },
    /// answer sent, waiting for the remote media
    Answering,
    Connected {
        since: Instant,
    },
    /// shown until the settle delay passes
    Ended,
}

impl Phase {
    fn is_active(&self) -> bool {
        !matches!(self, Phase::Idle | Phase::Ended)
    }
}

/// A peer connection plus the remote candidates that arrived before the remote
/// description did.
struct PeerLink {
    id: Uuid,
    pc: Box<dyn PeerConnection>,
    has_remote: bool,
    pending: Vec<IceCandidate>,
}

impl PeerLink {
    async fn open(
        transport: &dyn PeerTransport,
        ice_servers: &[IceServer],
        ch: UnboundedSender<TransportEvent>,
        stream: &LocalStream,
    ) -> Result<Self, Error> {
        let id = Uuid::new_v4();
        let pc = transport
            .create_connection(ice_servers, TransportEvents::new(id, ch))
            .await?;
        let mut link = Self {
            id,
            pc,
            has_remote: false,
            pending: vec![],
        };
        for track in stream.tracks() {
            if let Err(e) = link.pc.add_track(track).await {
                link.close().await;
                return Err(e);
            }
        }
        Ok(link)
    }

    async fn offer(&mut self) -> Result<SessionDescription, Error> {
        let offer = self.pc.create_offer().await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    async fn answer(
        &mut self,
        offer: SessionDescription,
        candidates: Vec<IceCandidate>,
    ) -> Result<SessionDescription, Error> {
        self.pending.extend(candidates);
        self.apply_remote(offer).await?;
        let answer = self.pc.create_answer().await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn apply_remote(&mut self, sdp: SessionDescription) -> Result<(), Error> {
        self.pc.set_remote_description(sdp).await?;
        self.has_remote = true;
        for candidate in std::mem::take(&mut self.pending) {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                log::warn!("failed to add buffered ice candidate: {e}");
            }
        }
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) {
        if !self.has_remote {
            self.pending.push(candidate);
            return;
        }
        if let Err(e) = self.pc.add_ice_candidate(candidate).await {
            log::warn!("failed to add ice candidate: {e}");
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.pc.close().await {
            log::error!("failed to close peer connection: {e}");
        }
    }
}

struct Actor {
    own_id: ParticipantId,
    remote_id: ParticipantId,
    topic: String,
    config: Config,
    transport: Arc<dyn PeerTransport>,
    devices: Arc<dyn MediaDevices>,
    call_log: Arc<dyn CallLogStore>,
    channel: ChannelSlot,
    signal_tx: UnboundedSender<SignalingMessage>,
    transport_tx: UnboundedSender<TransportEvent>,
    channel_lost_tx: UnboundedSender<()>,
    session: CallSession,
    // last status announced with StatusChanged
    reported_status: CallStatus,
    session_tx: watch::Sender<CallSession>,
    ui_event_ch: broadcast::Sender<CallEventKind>,
    phase: Phase,
    link: Option<PeerLink>,
    // only the caller has one
    call_log_writer: Option<CallLogWriter>,
    ticker: Option<Interval>,
    settle: Option<Pin<Box<Sleep>>>,
}

async fn next_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

async fn settled(sleep: Option<&mut Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => futures::future::pending::<()>().await,
    }
}

async fn run(
    mut actor: Actor,
    mut cmd_rx: UnboundedReceiver<Cmd>,
    mut signal_rx: UnboundedReceiver<SignalingMessage>,
    mut transport_rx: UnboundedReceiver<TransportEvent>,
    mut channel_lost_rx: UnboundedReceiver<()>,
    notify: Arc<Notify>,
) {
    loop {
        tokio::select! {
            // user commands win over whatever arrived in the meantime
            biased;
            _ = notify.notified() => {
                log::debug!("quitting call controller");
                break;
            }
            opt = cmd_rx.recv() => {
                let cmd = match opt {
                    Some(r) => r,
                    None => {
                        log::debug!("call controller cmd_rx channel is closed. quitting");
                        break;
                    }
                };
                actor.handle_cmd(cmd).await;
            }
            Some(message) = signal_rx.recv() => {
                actor.handle_signal(message).await;
            }
            Some(event) = transport_rx.recv() => {
                actor.handle_transport(event).await;
            }
            Some(()) = channel_lost_rx.recv() => {
                actor.on_channel_lost().await;
            }
            _ = next_tick(actor.ticker.as_mut()) => {
                actor.on_tick();
            }
            _ = settled(actor.settle.as_mut()) => {
                actor.on_settled();
            }
        }
    }
    actor.shutdown().await;
}

impl Actor {
    async fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::StartCall { video, rsp } => {
                let _ = rsp.send(self.start_call(video).await);
            }
            Cmd::AnswerCall { rsp } => {
                let _ = rsp.send(self.answer_call().await);
            }
            Cmd::RejectCall { rsp } => {
                let _ = rsp.send(self.reject_call().await);
            }
            Cmd::EndCall { rsp } => {
                let _ = rsp.send(self.end_call().await);
            }
            Cmd::ToggleMute { rsp } => {
                let _ = rsp.send(self.toggle(MediaKind::Audio));
            }
            Cmd::ToggleCamera { rsp } => {
                let _ = rsp.send(self.toggle(MediaKind::Video));
            }
            Cmd::ClearError { rsp } => {
                self.session.error = None;
                self.publish();
                let _ = rsp.send(Ok(()));
            }
        }
    }

    // ------ snapshot and events ------

    fn publish(&mut self) {
        self.session_tx.send_replace(self.session.clone());
        let status = self.session.status;
        if status != self.reported_status {
            log::debug!("call status {} -> {status}", self.reported_status);
            self.reported_status = status;
            self.emit(CallEventKind::StatusChanged { status });
        }
    }

    fn emit(&self, event: CallEventKind) {
        // no receivers is fine
        let _ = self.ui_event_ch.send(event);
    }

    fn report_error(&mut self, message: String) {
        log::warn!("call error: {message}");
        self.session.error = Some(message.clone());
        self.publish();
        self.emit(CallEventKind::Error { message });
    }

    // ------ signaling ------

    async fn open_channel(&mut self) -> Result<(), Error> {
        let handle = self.channel.open(&self.topic).await?;
        for kind in SignalKind::ALL {
            let tx = self.signal_tx.clone();
            handle.on_message(kind, move |message| {
                let _ = tx.send(message);
            });
        }
        let lost_tx = self.channel_lost_tx.clone();
        handle.on_end(move || {
            let _ = lost_tx.send(());
        });
        handle.listen();
        Ok(())
    }

    /// the service ended the subscription. without it no call can ring, so resubscribe
    async fn on_channel_lost(&mut self) {
        if self.channel.is_open() {
            // a stale notice from a handle that was already replaced
            return;
        }
        log::warn!("signaling channel {} was lost. reopening", self.topic);
        if let Err(e) = self.open_channel().await {
            log::error!("failed to reopen signaling channel {}: {e}", self.topic);
            self.report_error("Lost connection to the call service".into());
        }
    }

    async fn send(&self, message: SignalingMessage) {
        log::debug!("sending {message} to {}", self.remote_id);
        self.channel.send(&message).await;
    }

    // ------ control surface ------

    async fn start_call(&mut self, video: bool) -> Result<(), Error> {
        if !matches!(self.phase, Phase::Idle) {
            log::debug!("tried to start a call while {}", self.session.status);
            return Err(Error::CallAlreadyInProgress);
        }
        self.session.error = None;

        let stream = match self.devices.acquire(MediaConstraints::call(video)).await {
            Ok(r) => r,
            Err(e) => {
                self.report_error(e.user_message());
                return Err(e.into());
            }
        };

        let mut link = match PeerLink::open(
            &*self.transport,
            &self.config.ice_servers,
            self.transport_tx.clone(),
            &stream,
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                stream.stop();
                self.report_error(format!("Could not start the call: {e}"));
                return Err(e);
            }
        };
        let offer = match link.offer().await {
            Ok(r) => r,
            Err(e) => {
                link.close().await;
                stream.stop();
                self.report_error(format!("Could not start the call: {e}"));
                return Err(e);
            }
        };

        log::info!("calling {}", self.remote_id);
        self.link = Some(link);
        self.phase = Phase::Dialing;
        self.session.is_video = video;
        self.session.local_stream = Some(stream);
        self.session.status = CallStatus::Calling;
        self.publish();

        // the pair topic is normally already open from listening for incoming calls
        if !self.channel.is_open() {
            if let Err(e) = self.open_channel().await {
                log::error!("failed to open signaling channel {}: {e}", self.topic);
            }
        }
        self.send(SignalingMessage::Offer {
            from: self.own_id.clone(),
            offer,
            is_video: video,
        })
        .await;

        self.call_log_writer = Some(CallLogWriter::spawn(
            self.call_log.clone(),
            NewCallLog::new(
                self.own_id.clone(),
                self.remote_id.clone(),
                CallLogStatus::Missed,
            ),
        ));
        Ok(())
    }

    async fn answer_call(&mut self) -> Result<(), Error> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Incoming {
                offer,
                is_video,
                candidates,
            } => self.accept(offer, is_video, candidates).await,
            other => {
                self.phase = other;
                Err(Error::NoIncomingCall)
            }
        }
    }

    /// answers a remote offer. on failure the caller is told the call was declined
    async fn accept(
        &mut self,
        offer: SessionDescription,
        is_video: bool,
        candidates: Vec<IceCandidate>,
    ) -> Result<(), Error> {
        self.session.error = None;

        let stream = match self.devices.acquire(MediaConstraints::call(is_video)).await {
            Ok(r) => r,
            Err(e) => {
                self.decline().await;
                self.report_error(e.user_message());
                return Err(e.into());
            }
        };

        let mut link = match PeerLink::open(
            &*self.transport,
            &self.config.ice_servers,
            self.transport_tx.clone(),
            &stream,
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                stream.stop();
                self.decline().await;
                self.report_error(format!("Could not answer the call: {e}"));
                return Err(e);
            }
        };
        let answer = match link.answer(offer, candidates).await {
            Ok(r) => r,
            Err(e) => {
                link.close().await;
                stream.stop();
                self.decline().await;
                self.report_error(format!("Could not answer the call: {e}"));
                return Err(e);
            }
        };

        log::info!("answering call from {}", self.remote_id);
        self.link = Some(link);
        self.phase = Phase::Answering;
        self.session.incoming = None;
        self.session.is_video = is_video;
        self.session.local_stream = Some(stream);
        self.session.status = CallStatus::Ringing;
        self.publish();

        self.send(SignalingMessage::Answer {
            from: self.own_id.clone(),
            answer,
        })
        .await;
        Ok(())
    }

    /// tells the other side the offer will not be answered and goes back to idle
    async fn decline(&mut self) {
        self.send(SignalingMessage::CallRejected {
            from: self.own_id.clone(),
        })
        .await;
        self.release().await;
        self.phase = Phase::Idle;
        self.session.reset(CallStatus::Idle);
        self.publish();
    }

    async fn reject_call(&mut self) -> Result<(), Error> {
        match self.phase {
            Phase::Incoming { .. } | Phase::Answering => {
                log::info!("rejecting call from {}", self.remote_id);
                self.decline().await;
                self.emit(CallEventKind::CallEnded {
                    reason: EndReason::Rejected,
                    duration: 0,
                });
                Ok(())
            }
            Phase::Dialing => {
                // the caller withdraws the offer before it was answered
                log::info!("cancelling call to {}", self.remote_id);
                if let Some(writer) = self.call_log_writer.take() {
                    writer.finalize(CallLogStatus::Missed, 0, Utc::now());
                }
                self.decline().await;
                self.emit(CallEventKind::CallEnded {
                    reason: EndReason::HangUp,
                    duration: 0,
                });
                Ok(())
            }
            _ => Err(Error::NoIncomingCall),
        }
    }

    async fn end_call(&mut self) -> Result<(), Error> {
        match self.phase {
            Phase::Idle => return Err(Error::CallNotInProgress),
            Phase::Ended => return Ok(()),
            _ => {}
        }
        self.send(SignalingMessage::CallEnded {
            from: self.own_id.clone(),
        })
        .await;
        self.finish(EndReason::HangUp).await;
        Ok(())
    }

    fn toggle(&mut self, kind: MediaKind) -> Result<bool, Error> {
        let stream = self
            .session
            .local_stream
            .as_ref()
            .ok_or(Error::CallNotInProgress)?;
        let enabled = stream.toggle(kind).ok_or(Error::InvalidCallState {
            status: self.session.status,
        })?;
        let off = !enabled;
        match kind {
            MediaKind::Audio => self.session.is_muted = off,
            MediaKind::Video => self.session.is_camera_off = off,
        }
        log::debug!("{kind} tracks enabled: {enabled}");
        self.publish();
        Ok(off)
    }

    // ------ teardown ------

    /// stops everything call specific that the actor owns
    async fn release(&mut self) {
        self.ticker = None;
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        if let Some(stream) = self.session.local_stream.take() {
            stream.stop();
        }
    }

    async fn finish(&mut self, reason: EndReason) {
        let duration = match self.phase {
            Phase::Connected { since } => since.elapsed().as_secs(),
            _ => 0,
        };
        self.release().await;

        if let Some(writer) = self.call_log_writer.take() {
            let status = match reason {
                EndReason::Rejected => CallLogStatus::Rejected,
                _ if duration > 0 => CallLogStatus::Completed,
                _ => CallLogStatus::Missed,
            };
            writer.finalize(status, duration, Utc::now());
        }

        log::info!(
            "call with {} ended ({reason}) after {duration}s",
            self.remote_id
        );
        self.phase = Phase::Ended;
        self.session.reset(CallStatus::Ended);
        self.session.duration = duration;
        self.settle = Some(Box::pin(tokio::time::sleep(self.config.ended_settle())));
        self.publish();
        self.emit(CallEventKind::CallEnded { reason, duration });
    }

    fn on_settled(&mut self) {
        self.settle = None;
        if matches!(self.phase, Phase::Ended) {
            self.phase = Phase::Idle;
            self.session.reset(CallStatus::Idle);
            self.publish();
        }
    }

    fn on_tick(&mut self) {
        if let Phase::Connected { since } = self.phase {
            self.session.duration = since.elapsed().as_secs();
            self.publish();
        }
    }

    async fn shutdown(&mut self) {
        if self.phase.is_active() {
            self.send(SignalingMessage::CallEnded {
                from: self.own_id.clone(),
            })
            .await;
            self.finish(EndReason::HangUp).await;
        }
        self.channel.close().await;
    }

    // ------ remote side ------

    async fn handle_signal(&mut self, message: SignalingMessage) {
        if message.sender() != &self.remote_id {
            log::debug!("ignoring {message} from {}", message.sender());
            return;
        }
        match message {
            SignalingMessage::Offer {
                offer, is_video, ..
            } => self.on_offer(offer, is_video).await,
            SignalingMessage::Answer { answer, .. } => self.on_answer(answer).await,
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.on_candidate(candidate).await
            }
            SignalingMessage::CallRejected { .. } => {
                let reason = match self.phase {
                    Phase::Connected { .. } => EndReason::RemoteHangUp,
                    _ => EndReason::Rejected,
                };
                self.on_remote_end(reason).await
            }
            SignalingMessage::CallEnded { .. } => self.on_remote_end(EndReason::RemoteHangUp).await,
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription, is_video: bool) {
        match self.phase {
            Phase::Idle | Phase::Ended => {
                log::info!("incoming call from {}", self.remote_id);
                self.settle = None;
                self.phase = Phase::Incoming {
                    offer: offer.clone(),
                    is_video,
                    candidates: vec![],
                };
                self.session.reset(CallStatus::Ringing);
                self.session.is_video = is_video;
                self.session.incoming = Some(IncomingCall {
                    from: self.remote_id.clone(),
                    offer,
                    is_video,
                });
                self.publish();
                self.emit(CallEventKind::IncomingCall {
                    from: self.remote_id.clone(),
                    is_video,
                });
            }
            Phase::Dialing => {
                // both sides dialed. the greater id keeps its call
                if self.own_id > self.remote_id {
                    log::debug!("glare with {}: keeping own call", self.remote_id);
                    return;
                }
                log::info!("glare with {}: answering their call", self.remote_id);
                self.release().await;
                if let Some(writer) = self.call_log_writer.take() {
                    writer.finalize(CallLogStatus::Missed, 0, Utc::now());
                }
                if let Err(e) = self.accept(offer, is_video, vec![]).await {
                    log::error!("failed to answer call after glare: {e}");
                }
            }
            _ => log::debug!("ignoring offer while {}", self.session.status),
        }
    }

    async fn on_answer(&mut self, answer: SessionDescription) {
        if !matches!(self.phase, Phase::Dialing) {
            log::debug!("ignoring answer while {}", self.session.status);
            return;
        }
        let link = match self.link.as_mut() {
            Some(r) => r,
            None => return,
        };
        if link.has_remote {
            log::debug!("ignoring duplicate answer");
            return;
        }
        if let Err(e) = link.apply_remote(answer).await {
            log::error!("failed to apply answer: {e}");
            self.report_error(format!("Could not connect the call: {e}"));
            self.send(SignalingMessage::CallEnded {
                from: self.own_id.clone(),
            })
            .await;
            self.finish(EndReason::ConnectionLost).await;
        }
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) {
        match &mut self.phase {
            Phase::Incoming { candidates, .. } => candidates.push(candidate),
            Phase::Dialing | Phase::Answering | Phase::Connected { .. } => {
                if let Some(link) = self.link.as_mut() {
                    link.add_candidate(candidate).await;
                }
            }
            Phase::Idle | Phase::Ended => log::debug!("ignoring ice candidate while idle"),
        }
    }

    async fn on_remote_end(&mut self, reason: EndReason) {
        if !self.phase.is_active() {
            log::debug!("ignoring {reason} while {}", self.session.status);
            return;
        }
        self.finish(reason).await;
    }

    // ------ transport ------

    async fn handle_transport(&mut self, event: TransportEvent) {
        if self.link.as_ref().map(|l| l.id) != Some(event.connection_id) {
            log::trace!("ignoring {} from closed connection", event.kind);
            return;
        }
        match event.kind {
            TransportEventKind::LocalCandidate(candidate) => {
                self.send(SignalingMessage::IceCandidate {
                    from: self.own_id.clone(),
                    candidate,
                })
                .await;
            }
            TransportEventKind::RemoteTrack(track) => self.on_remote_track(track),
            TransportEventKind::StateChanged(state) => {
                log::debug!("peer connection state: {state}");
                if state.is_terminal_failure() && self.phase.is_active() {
                    self.send(SignalingMessage::CallEnded {
                        from: self.own_id.clone(),
                    })
                    .await;
                    self.finish(EndReason::ConnectionLost).await;
                }
            }
        }
    }

    fn on_remote_track(&mut self, track: RemoteTrack) {
        let stream = self.session.remote_stream.get_or_insert_with(Default::default);
        stream.add_track(track);
        let stream = stream.clone();

        if matches!(self.phase, Phase::Dialing | Phase::Answering) {
            log::info!("call with {} connected", self.remote_id);
            let now = Instant::now();
            self.phase = Phase::Connected { since: now };
            self.session.status = CallStatus::Connected;
            self.session.duration = 0;
            let tick = self.config.duration_tick();
            self.ticker = Some(tokio::time::interval_at(now + tick, tick));
            if let Some(writer) = &self.call_log_writer {
                writer.update(CallLogUpdate::status(CallLogStatus::Completed));
            }
        }
        self.publish();
        self.emit(CallEventKind::RemoteStreamAdded { stream });
    }
}
