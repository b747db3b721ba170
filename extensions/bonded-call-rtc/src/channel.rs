//! The signaling channel adapter: a subscription to the pair topic that decodes broadcasts
//! into [`SignalingMessage`]s and hands them to the registered callbacks.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bonded::{error::Error, sync::RwLock};
use futures::StreamExt;
use tokio::{
    sync::{oneshot, Notify},
    task::JoinHandle,
};

use crate::{
    notify_wrapper::NotifyWrapper,
    pubsub::{Broadcast, PubSub},
    signaling::{SignalKind, SignalingMessage},
};

type Callback = Arc<dyn Fn(SignalingMessage) + Send + Sync>;
type Callbacks = Arc<RwLock<HashMap<SignalKind, Vec<Callback>>>>;
type EndCallbacks = Arc<RwLock<Vec<Arc<dyn Fn() + Send + Sync>>>>;

/// An open subscription to one topic. Dropping the handle closes it.
pub struct ChannelHandle {
    topic: String,
    pubsub: Arc<dyn PubSub>,
    callbacks: Callbacks,
    on_end: EndCallbacks,
    // set by the dispatch task when the service ended the subscription
    ended: Arc<AtomicBool>,
    listen: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    closed: bool,
    // stops the dispatch task on drop
    notify: NotifyWrapper,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("topic", &self.topic)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ChannelHandle {
    /// Subscribes to `topic` and waits up to `timeout` for the acknowledgment. A late
    /// acknowledgment is not an error: the subscription stays pending and attaches when the
    /// service answers. Messages are held until [`ChannelHandle::listen`] is called so that
    /// callbacks can be registered first.
    pub async fn open(
        pubsub: Arc<dyn PubSub>,
        topic: &str,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let notify = Arc::new(Notify::new());
        let callbacks: Callbacks = Default::default();
        let on_end: EndCallbacks = Default::default();
        let ended = Arc::new(AtomicBool::new(false));
        let (ack_tx, ack_rx) = oneshot::channel();
        let (listen_tx, listen_rx) = oneshot::channel();

        let task = tokio::spawn(dispatch(
            pubsub.clone(),
            topic.to_string(),
            callbacks.clone(),
            Lost {
                flag: ended.clone(),
                callbacks: on_end.clone(),
            },
            ack_tx,
            listen_rx,
            notify.clone(),
        ));
        let handle = Self {
            topic: topic.to_string(),
            pubsub,
            callbacks,
            on_end,
            ended,
            listen: Some(listen_tx),
            task: Some(task),
            closed: false,
            notify: NotifyWrapper { notify },
        };

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                log::debug!("subscribed to {topic}");
            }
            Ok(Ok(Err(e))) => {
                log::error!("failed to subscribe to {topic}: {e}");
                return Err(e);
            }
            Ok(Err(_)) => return Err(Error::ChannelClosed),
            Err(_) => {
                log::warn!(
                    "subscription to {topic} not acknowledged after {}ms. continuing",
                    timeout.as_millis()
                );
            }
        }
        Ok(handle)
    }

    /// true once closed locally or once the dispatch task stopped for any reason
    pub fn is_closed(&self) -> bool {
        self.closed
            || self.ended.load(Ordering::SeqCst)
            || self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    /// registers a callback fired when the subscription ends without [`ChannelHandle::close`]
    /// being called, e.g. a failed late subscribe or a stream closed by the service
    pub fn on_end<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_end.write().push(Arc::new(callback));
    }

    /// registers a callback for one kind of message. several callbacks per kind are allowed
    pub fn on_message<F>(&self, kind: SignalKind, callback: F)
    where
        F: Fn(SignalingMessage) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(callback));
    }

    /// starts delivering messages to the callbacks
    pub fn listen(&mut self) {
        if let Some(tx) = self.listen.take() {
            let _ = tx.send(());
        }
    }

    /// best effort. publish failures are logged and a closed handle sends nothing
    pub async fn send(&self, message: &SignalingMessage) {
        if self.is_closed() {
            log::debug!("dropping {message} on closed channel {}", self.topic);
            return;
        }
        let broadcast = match encode(message) {
            Ok(r) => r,
            Err(e) => {
                log::error!("failed to encode {message}: {e}");
                return;
            }
        };
        if let Err(e) = self.pubsub.publish(&self.topic, broadcast).await {
            log::error!("failed to send {message} on {}: {e}", self.topic);
        }
    }

    /// unsubscribes. safe to call repeatedly
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.listen.take();
        self.notify.notify.notify_one();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("channel task for {} failed: {e}", self.topic);
            }
        }
        log::debug!("closed channel {}", self.topic);
    }
}

pub fn encode(message: &SignalingMessage) -> Result<Broadcast, Error> {
    let value = serde_json::to_value(message)?;
    Ok(serde_json::from_value(value)?)
}

pub fn decode(broadcast: &Broadcast) -> Result<SignalingMessage, Error> {
    let value = serde_json::to_value(broadcast)?;
    Ok(serde_json::from_value(value)?)
}

struct Lost {
    flag: Arc<AtomicBool>,
    callbacks: EndCallbacks,
}

impl Lost {
    fn fire(&self, topic: &str) {
        self.flag.store(true, Ordering::SeqCst);
        log::warn!("subscription to {topic} was lost");
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback();
        }
    }
}

async fn dispatch(
    pubsub: Arc<dyn PubSub>,
    topic: String,
    callbacks: Callbacks,
    lost: Lost,
    ack_tx: oneshot::Sender<Result<(), Error>>,
    listen_rx: oneshot::Receiver<()>,
    notify: Arc<Notify>,
) {
    let subscription = tokio::select! {
        _ = notify.notified() => return,
        r = pubsub.subscribe(&topic) => r,
    };
    let mut subscription = match subscription {
        Ok(r) => r,
        Err(e) => {
            // nobody waits for the ack anymore, so the failure has to be reported here
            if let Err(Err(e)) = ack_tx.send(Err(e)) {
                log::error!("late subscription to {topic} failed: {e}");
                lost.fire(&topic);
            }
            return;
        }
    };
    let _ = ack_tx.send(Ok(()));

    let listening = tokio::select! {
        _ = notify.notified() => false,
        r = listen_rx => r.is_ok(),
    };

    if listening {
        loop {
            tokio::select! {
                _ = notify.notified() => break,
                opt = subscription.stream.next() => {
                    let broadcast = match opt {
                        Some(r) => r,
                        None => {
                            lost.fire(&topic);
                            break;
                        }
                    };
                    let message = match decode(&broadcast) {
                        Ok(r) => r,
                        Err(e) => {
                            log::warn!("dropping broadcast {} on {topic}: {e}", broadcast.event);
                            continue;
                        }
                    };
                    let targets = callbacks
                        .read()
                        .get(&message.kind())
                        .cloned()
                        .unwrap_or_default();
                    if targets.is_empty() {
                        log::trace!("no callback for {message} on {topic}");
                    }
                    for callback in targets {
                        callback(message.clone());
                    }
                }
            }
        }
    }

    if let Err(e) = pubsub.unsubscribe(&topic, subscription.id).await {
        log::warn!("failed to unsubscribe from {topic}: {e}");
    }
}

/// Exclusive owner of the channel for a controller. Opening closes whatever the slot
/// held before, so an old subscription can never outlive its replacement.
pub struct ChannelSlot {
    pubsub: Arc<dyn PubSub>,
    timeout: Duration,
    current: Option<ChannelHandle>,
}

impl ChannelSlot {
    pub fn new(pubsub: Arc<dyn PubSub>, timeout: Duration) -> Self {
        Self {
            pubsub,
            timeout,
            current: None,
        }
    }

    pub async fn open(&mut self, topic: &str) -> Result<&mut ChannelHandle, Error> {
        self.close().await;
        let handle = ChannelHandle::open(self.pubsub.clone(), topic, self.timeout).await?;
        Ok(self.current.insert(handle))
    }

    pub fn is_open(&self) -> bool {
        self.current.as_ref().map(|h| !h.is_closed()).unwrap_or_default()
    }

    /// no-op when the slot is empty
    pub async fn send(&self, message: &SignalingMessage) {
        match &self.current {
            Some(handle) => handle.send(message).await,
            None => log::debug!("no open channel. dropping {message}"),
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut handle) = self.current.take() {
            handle.close().await;
        }
    }
}
