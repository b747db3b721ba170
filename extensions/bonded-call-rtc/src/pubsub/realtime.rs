//! Client for the hosted realtime service. The service speaks the Phoenix channel protocol
//! over a websocket: a topic is joined with `phx_join` and acknowledged by a `phx_reply`
//! carrying the same ref, broadcasts travel as `broadcast` events, and the socket is kept
//! alive with a `heartbeat` on the `phoenix` topic.
//!
//! Subscriptions outlive the socket. When the socket is lost the client reconnects with a
//! stepped backoff and joins every topic again; a topic the service closes or errors is
//! joined again on the next heartbeat.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bonded::error::Error;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, Notify,
    },
};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use super::{Broadcast, PubSub, Subscription};
use crate::{config::RealtimeConfig, notify_wrapper::NotifyWrapper};

const TOPIC_PREFIX: &str = "realtime:";
const PHOENIX_TOPIC: &str = "phoenix";
const RECONNECT_STEPS_MS: [u64; 4] = [1_000, 2_000, 5_000, 10_000];

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<Socket, Message>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PhxMessage {
    topic: String,
    event: String,
    payload: serde_json::Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

enum Cmd {
    Subscribe {
        topic: String,
        rsp: oneshot::Sender<Result<Subscription, Error>>,
    },
    Publish {
        topic: String,
        message: Broadcast,
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    Unsubscribe {
        topic: String,
        id: Uuid,
    },
}

#[derive(Clone)]
pub struct RealtimeClient {
    ch: UnboundedSender<Cmd>,
    // when RealtimeClient gets cloned, NotifyWrapper doesn't get cloned.
    // when NotifyWrapper finally gets dropped, the socket task is told to quit
    notify: Arc<NotifyWrapper>,
}

impl RealtimeClient {
    /// fails if the first connection cannot be made. later losses are handled by reconnecting
    pub async fn connect(config: RealtimeConfig) -> Result<Self, Error> {
        let socket = open_socket(&config).await?;
        log::debug!("connected to realtime service");

        let (tx, rx) = mpsc::unbounded_channel();
        let notify = Arc::new(Notify::new());
        let notify2 = notify.clone();
        tokio::spawn(async move {
            run(socket, config, rx, notify2).await;
        });
        Ok(Self {
            ch: tx,
            notify: Arc::new(NotifyWrapper { notify }),
        })
    }
}

#[async_trait]
impl PubSub for RealtimeClient {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::Subscribe {
                topic: topic.to_string(),
                rsp: tx,
            })
            .map_err(|_| Error::SenderChannelUnavailable)?;
        rx.await.map_err(|_| Error::ReceiverChannelUnavailable)?
    }

    async fn publish(&self, topic: &str, message: Broadcast) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::Publish {
                topic: topic.to_string(),
                message,
                rsp: tx,
            })
            .map_err(|_| Error::SenderChannelUnavailable)?;
        rx.await.map_err(|_| Error::ReceiverChannelUnavailable)?
    }

    async fn unsubscribe(&self, topic: &str, id: Uuid) -> Result<(), Error> {
        self.ch
            .send(Cmd::Unsubscribe {
                topic: topic.to_string(),
                id,
            })
            .map_err(|_| Error::SenderChannelUnavailable)
    }
}

struct PendingJoin {
    id: Uuid,
    rx: UnboundedReceiver<Broadcast>,
    rsp: oneshot::Sender<Result<Subscription, Error>>,
}

#[derive(Default)]
struct JoinedTopic {
    // empty while no join is in flight
    join_ref: String,
    joined: bool,
    subscribers: HashMap<Uuid, UnboundedSender<Broadcast>>,
    pending: Vec<PendingJoin>,
}

struct Refs(u64);

impl Refs {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

fn reconnect_delay(attempt: usize) -> Duration {
    let step = RECONNECT_STEPS_MS[attempt.min(RECONNECT_STEPS_MS.len() - 1)];
    Duration::from_millis(step)
}

fn subscription(topic: &str, id: Uuid, mut rx: UnboundedReceiver<Broadcast>) -> Subscription {
    let stream = async_stream::stream! {
        while let Some(msg) = rx.recv().await {
            yield msg;
        }
    };
    Subscription {
        id,
        topic: topic.to_string(),
        stream: Box::pin(stream),
    }
}

fn join_message(topic: &str, join_ref: &str, config: &RealtimeConfig) -> PhxMessage {
    let mut payload = serde_json::json!({
        "config": {
            "broadcast": { "self": false, "ack": false },
            "presence": { "key": "" },
            "private": false
        }
    });
    if let Some(token) = &config.access_token {
        payload["access_token"] = serde_json::Value::String(token.clone());
    }
    PhxMessage {
        topic: format!("{TOPIC_PREFIX}{topic}"),
        event: "phx_join".into(),
        payload,
        reference: Some(join_ref.to_string()),
    }
}

fn broadcast_message(topic: &str, message: &Broadcast, reference: String) -> PhxMessage {
    PhxMessage {
        topic: format!("{TOPIC_PREFIX}{topic}"),
        event: "broadcast".into(),
        payload: serde_json::json!({
            "type": "broadcast",
            "event": message.event,
            "payload": message.payload,
        }),
        reference: Some(reference),
    }
}

/// pulls the inner broadcast out of a `broadcast` frame
fn parse_broadcast(payload: &serde_json::Value) -> Option<Broadcast> {
    let event = payload.get("event")?.as_str()?.to_string();
    let payload = payload
        .get("payload")
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    Some(Broadcast { event, payload })
}

async fn open_socket(config: &RealtimeConfig) -> Result<Socket, Error> {
    let url = config.socket_url()?;
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| Error::OtherWithContext(format!("realtime connect failed: {e}")))?;
    Ok(socket)
}

async fn send_frame(sink: &mut WsSink, msg: &PhxMessage) -> Result<(), Error> {
    let text = serde_json::to_string(msg)?;
    sink.send(Message::Text(text.into())).await.map_err(|e| {
        log::error!("failed to write realtime frame: {e}");
        Error::FailedToSendSignal(e.to_string())
    })
}

/// Topics and their subscribers. Survives reconnects.
struct State {
    config: RealtimeConfig,
    refs: Refs,
    topics: HashMap<String, JoinedTopic>,
}

impl State {
    fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            refs: Refs(0),
            topics: HashMap::new(),
        }
    }

    /// `sink` is `None` while the socket is down. an error means the socket is unusable
    async fn handle_cmd(&mut self, cmd: Cmd, sink: Option<&mut WsSink>) -> Result<(), Error> {
        match cmd {
            Cmd::Subscribe { topic, rsp } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let id = Uuid::new_v4();
                let entry = self.topics.entry(topic.clone()).or_default();
                entry.subscribers.insert(id, tx);
                if entry.joined {
                    let _ = rsp.send(Ok(subscription(&topic, id, rx)));
                    return Ok(());
                }
                entry.pending.push(PendingJoin { id, rx, rsp });
                match sink {
                    Some(sink) => self.send_joins(sink).await,
                    // joined once the socket is back
                    None => Ok(()),
                }
            }
            Cmd::Publish {
                topic,
                message,
                rsp,
            } => {
                let joined = self.topics.get(&topic).map(|t| t.joined).unwrap_or_default();
                let sink = match sink {
                    Some(r) if joined => r,
                    _ => {
                        let _ = rsp.send(Err(Error::ChannelClosed));
                        return Ok(());
                    }
                };
                let msg = broadcast_message(&topic, &message, self.refs.next());
                match send_frame(sink, &msg).await {
                    Ok(()) => {
                        let _ = rsp.send(Ok(()));
                        Ok(())
                    }
                    Err(e) => {
                        let _ = rsp.send(Err(Error::FailedToSendSignal(e.to_string())));
                        Err(e)
                    }
                }
            }
            Cmd::Unsubscribe { topic, id } => {
                let empty = match self.topics.get_mut(&topic) {
                    Some(entry) => {
                        entry.subscribers.remove(&id);
                        entry.pending.retain(|p| p.id != id);
                        entry.subscribers.is_empty()
                    }
                    None => false,
                };
                if !empty {
                    return Ok(());
                }
                self.topics.remove(&topic);
                match sink {
                    Some(sink) => {
                        let msg = PhxMessage {
                            topic: format!("{TOPIC_PREFIX}{topic}"),
                            event: "phx_leave".into(),
                            payload: serde_json::json!({}),
                            reference: Some(self.refs.next()),
                        };
                        send_frame(sink, &msg).await
                    }
                    None => Ok(()),
                }
            }
        }
    }

    /// joins every topic that is neither joined nor waiting for its reply
    async fn send_joins(&mut self, sink: &mut WsSink) -> Result<(), Error> {
        for (topic, entry) in self.topics.iter_mut() {
            if entry.joined || !entry.join_ref.is_empty() {
                continue;
            }
            entry.join_ref = self.refs.next();
            let msg = join_message(topic, &entry.join_ref, &self.config);
            if let Err(e) = send_frame(sink, &msg).await {
                entry.join_ref.clear();
                return Err(e);
            }
        }
        Ok(())
    }

    /// the socket is gone. every topic that still has subscribers has to be joined again
    fn disconnected(&mut self) {
        self.topics.retain(|_, entry| {
            entry.joined = false;
            entry.join_ref.clear();
            entry.subscribers.retain(|_, tx| !tx.is_closed());
            !entry.subscribers.is_empty()
        });
    }

    fn on_frame(&mut self, msg: PhxMessage) {
        let topic = match msg.topic.strip_prefix(TOPIC_PREFIX) {
            Some(r) => r.to_string(),
            // heartbeat replies
            None => return,
        };
        match msg.event.as_str() {
            "phx_reply" => {
                let entry = match self.topics.get_mut(&topic) {
                    Some(r) => r,
                    None => return,
                };
                if entry.joined
                    || entry.join_ref.is_empty()
                    || msg.reference.as_deref() != Some(entry.join_ref.as_str())
                {
                    return;
                }
                let ok = msg.payload.get("status").and_then(|s| s.as_str()) == Some("ok");
                if ok {
                    log::debug!("joined realtime topic {topic}");
                    entry.joined = true;
                    for pending in entry.pending.drain(..) {
                        let sub = subscription(&topic, pending.id, pending.rx);
                        let _ = pending.rsp.send(Ok(sub));
                    }
                    return;
                }
                log::error!("realtime join for {topic} refused: {}", msg.payload);
                // dropping the senders ends the subscriptions
                if let Some(entry) = self.topics.remove(&topic) {
                    for pending in entry.pending {
                        let _ = pending.rsp.send(Err(Error::OtherWithContext(format!(
                            "join refused for {topic}"
                        ))));
                    }
                }
            }
            "broadcast" => {
                let broadcast = match parse_broadcast(&msg.payload) {
                    Some(r) => r,
                    None => {
                        log::warn!("broadcast frame without event on {topic}");
                        return;
                    }
                };
                if let Some(entry) = self.topics.get_mut(&topic) {
                    entry
                        .subscribers
                        .retain(|_, tx| tx.send(broadcast.clone()).is_ok());
                }
            }
            "phx_close" | "phx_error" => {
                if let Some(entry) = self.topics.get_mut(&topic) {
                    log::warn!("realtime topic {topic} dropped by the service ({})", msg.event);
                    entry.joined = false;
                    entry.join_ref.clear();
                }
            }
            _ => {}
        }
    }

    fn close(&mut self) {
        // dropping the senders ends every subscription stream
        for (_, entry) in self.topics.drain() {
            for pending in entry.pending {
                let _ = pending.rsp.send(Err(Error::ChannelClosed));
            }
        }
    }
}

enum Exit {
    Quit,
    Lost,
}

async fn run(
    socket: Socket,
    config: RealtimeConfig,
    mut cmd_rx: UnboundedReceiver<Cmd>,
    notify: Arc<Notify>,
) {
    let mut state = State::new(config);
    let mut socket = Some(socket);
    let mut attempt = 0;

    loop {
        if let Some(socket) = socket.take() {
            match serve(socket, &mut state, &mut cmd_rx, &notify).await {
                Exit::Quit => break,
                Exit::Lost => {
                    log::warn!("lost the realtime socket");
                    state.disconnected();
                }
            }
        }

        let delay = reconnect_delay(attempt);
        attempt += 1;
        log::info!("reconnecting to realtime service in {}ms", delay.as_millis());
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let quit = loop {
            tokio::select! {
                _ = notify.notified() => break true,
                _ = &mut sleep => break false,
                opt = cmd_rx.recv() => match opt {
                    Some(cmd) => {
                        let _ = state.handle_cmd(cmd, None).await;
                    }
                    None => break true,
                },
            }
        };
        if quit {
            break;
        }

        tokio::select! {
            _ = notify.notified() => break,
            r = open_socket(&state.config) => match r {
                Ok(r) => {
                    log::info!("reconnected to realtime service");
                    attempt = 0;
                    socket = Some(r);
                }
                Err(e) => log::warn!("{e}"),
            }
        }
    }
    log::debug!("realtime client stopped");
    state.close();
}

/// drives one connection until it is lost or the client goes away
async fn serve(
    socket: Socket,
    state: &mut State,
    cmd_rx: &mut UnboundedReceiver<Cmd>,
    notify: &Notify,
) -> Exit {
    let (mut sink, mut stream) = socket.split();
    if let Err(e) = state.send_joins(&mut sink).await {
        log::error!("failed to join realtime topics: {e}");
        return Exit::Lost;
    }
    let mut heartbeat = tokio::time::interval(state.config.heartbeat());

    loop {
        tokio::select! {
            _ = notify.notified() => {
                log::debug!("realtime client dropped. closing socket");
                let _ = sink.send(Message::Close(None)).await;
                return Exit::Quit;
            }
            _ = heartbeat.tick() => {
                let msg = PhxMessage {
                    topic: PHOENIX_TOPIC.into(),
                    event: "heartbeat".into(),
                    payload: serde_json::json!({}),
                    reference: Some(state.refs.next()),
                };
                if send_frame(&mut sink, &msg).await.is_err() {
                    return Exit::Lost;
                }
                // topics the service dropped since the last beat
                if state.send_joins(&mut sink).await.is_err() {
                    return Exit::Lost;
                }
            }
            opt = cmd_rx.recv() => {
                let cmd = match opt {
                    Some(r) => r,
                    None => {
                        log::debug!("realtime cmd channel closed. quitting");
                        return Exit::Quit;
                    }
                };
                if state.handle_cmd(cmd, Some(&mut sink)).await.is_err() {
                    return Exit::Lost;
                }
            }
            opt = stream.next() => {
                let frame = match opt {
                    Some(Ok(r)) => r,
                    Some(Err(e)) => {
                        log::error!("realtime socket error: {e}");
                        return Exit::Lost;
                    }
                    None => return Exit::Lost,
                };
                let text = match frame {
                    Message::Text(text) => text,
                    Message::Close(_) => {
                        log::debug!("realtime service closed the socket");
                        return Exit::Lost;
                    }
                    _ => continue,
                };
                match serde_json::from_str::<PhxMessage>(text.as_str()) {
                    Ok(msg) => state.on_frame(msg),
                    Err(e) => log::warn!("dropping undecodable realtime frame: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> RealtimeConfig {
        RealtimeConfig {
            url: "wss://example.supabase.co/realtime/v1/websocket".into(),
            api_key: "anon".into(),
            access_token: Some("jwt".into()),
            heartbeat_ms: 25_000,
        }
    }

    #[test]
    fn join_frame_shape() -> anyhow::Result<()> {
        let msg = join_message("call-a-b", "1", &config());
        let json = serde_json::to_value(&msg)?;
        assert_eq!(json["topic"], "realtime:call-a-b");
        assert_eq!(json["event"], "phx_join");
        assert_eq!(json["ref"], "1");
        assert_eq!(json["payload"]["config"]["broadcast"]["self"], false);
        assert_eq!(json["payload"]["access_token"], "jwt");
        Ok(())
    }

    #[test]
    fn broadcast_round_trips_through_frame() -> anyhow::Result<()> {
        let message = Broadcast {
            event: "call-ended".into(),
            payload: serde_json::json!({"from": "a"}),
        };
        let frame = broadcast_message("call-a-b", &message, "7".into());
        let text = serde_json::to_string(&frame)?;
        let decoded: PhxMessage = serde_json::from_str(&text)?;
        assert_eq!(decoded.event, "broadcast");
        assert_eq!(parse_broadcast(&decoded.payload), Some(message));
        Ok(())
    }

    #[test]
    fn server_reply_decodes() -> anyhow::Result<()> {
        let text = r#"{"topic":"realtime:call-a-b","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"3"}"#;
        let msg: PhxMessage = serde_json::from_str(text)?;
        assert_eq!(msg.reference.as_deref(), Some("3"));
        assert_eq!(msg.payload["status"], "ok");
        Ok(())
    }

    fn reply(topic: &str, reference: &str, status: &str) -> PhxMessage {
        PhxMessage {
            topic: format!("{TOPIC_PREFIX}{topic}"),
            event: "phx_reply".into(),
            payload: serde_json::json!({"status": status, "response": {}}),
            reference: Some(reference.into()),
        }
    }

    fn offer_frame(topic: &str) -> PhxMessage {
        let message = Broadcast {
            event: "offer".into(),
            payload: serde_json::json!({"from": "a"}),
        };
        broadcast_message(topic, &message, "9".into())
    }

    async fn joined_subscription(state: &mut State, topic: &str) -> anyhow::Result<Subscription> {
        let (tx, rx) = oneshot::channel();
        state
            .handle_cmd(
                Cmd::Subscribe {
                    topic: topic.into(),
                    rsp: tx,
                },
                None,
            )
            .await?;
        let join_ref = state.refs.next();
        if let Some(entry) = state.topics.get_mut(topic) {
            entry.join_ref = join_ref.clone();
        }
        state.on_frame(reply(topic, &join_ref, "ok"));
        Ok(rx.await??)
    }

    #[tokio::test]
    async fn subscribe_while_offline_waits_for_the_join() -> anyhow::Result<()> {
        let mut state = State::new(config());
        let (tx, mut rx) = oneshot::channel();
        state
            .handle_cmd(
                Cmd::Subscribe {
                    topic: "call-a-b".into(),
                    rsp: tx,
                },
                None,
            )
            .await?;

        let entry = &state.topics["call-a-b"];
        assert!(!entry.joined);
        // nothing in flight, so the next connection sends the join
        assert!(entry.join_ref.is_empty());
        assert!(rx.try_recv().is_err());

        // a reply to some other join is not ours
        state.on_frame(reply("call-a-b", "77", "ok"));
        assert!(!state.topics["call-a-b"].joined);
        Ok(())
    }

    #[tokio::test]
    async fn subscriptions_survive_a_lost_socket() -> anyhow::Result<()> {
        let mut state = State::new(config());
        let mut sub = joined_subscription(&mut state, "call-a-b").await?;

        state.disconnected();
        let entry = &state.topics["call-a-b"];
        assert!(!entry.joined);
        assert!(entry.join_ref.is_empty());
        assert_eq!(entry.subscribers.len(), 1);

        // joined again after reconnecting; the same stream keeps receiving
        let join_ref = state.refs.next();
        if let Some(entry) = state.topics.get_mut("call-a-b") {
            entry.join_ref = join_ref.clone();
        }
        state.on_frame(reply("call-a-b", &join_ref, "ok"));
        state.on_frame(offer_frame("call-a-b"));
        let received = sub.stream.next().await.map(|b| b.event);
        assert_eq!(received.as_deref(), Some("offer"));
        Ok(())
    }

    #[tokio::test]
    async fn topic_error_schedules_a_rejoin() -> anyhow::Result<()> {
        let mut state = State::new(config());
        let _sub = joined_subscription(&mut state, "call-a-b").await?;

        state.on_frame(PhxMessage {
            topic: "realtime:call-a-b".into(),
            event: "phx_error".into(),
            payload: serde_json::json!({}),
            reference: None,
        });
        let entry = &state.topics["call-a-b"];
        assert!(!entry.joined);
        assert!(entry.join_ref.is_empty());
        assert_eq!(entry.subscribers.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn publish_while_offline_fails() -> anyhow::Result<()> {
        let mut state = State::new(config());
        let _sub = joined_subscription(&mut state, "call-a-b").await?;
        let (tx, rx) = oneshot::channel();
        state
            .handle_cmd(
                Cmd::Publish {
                    topic: "call-a-b".into(),
                    message: Broadcast {
                        event: "call-ended".into(),
                        payload: serde_json::json!({"from": "a"}),
                    },
                    rsp: tx,
                },
                None,
            )
            .await?;
        assert!(matches!(rx.await?, Err(Error::ChannelClosed)));
        Ok(())
    }

    #[test]
    fn reconnect_backoff_steps_up_and_holds() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3), Duration::from_secs(10));
        assert_eq!(reconnect_delay(40), Duration::from_secs(10));
    }
}
