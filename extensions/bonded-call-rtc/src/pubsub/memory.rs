use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bonded::{error::Error, sync::RwLock};
use tokio::sync::mpsc::{self, UnboundedSender};
use uuid::Uuid;

use super::{Broadcast, PubSub, Subscription};

/// In-process bus. Every subscriber of a topic, including the publisher's own subscription,
/// receives each broadcast. Used for tests and for wiring two controllers in one process.
#[derive(Clone, Default)]
pub struct MemoryPubSub {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    topics: RwLock<HashMap<String, HashMap<Uuid, UnboundedSender<Broadcast>>>>,
    history: RwLock<Vec<(String, Broadcast)>>,
    subscribe_calls: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// number of live subscriptions on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|subs| subs.len())
            .unwrap_or_default()
    }

    /// how many times `subscribe` succeeded over the lifetime of the bus
    pub fn subscribe_calls(&self) -> usize {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }

    /// everything published on a topic, in order
    pub fn published(&self, topic: &str) -> Vec<Broadcast> {
        self.inner
            .history
            .read()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, b)| b.clone())
            .collect()
    }

    /// ends every subscription on a topic, as a service restart would
    pub fn drop_subscribers(&self, topic: &str) {
        self.inner.topics.write().remove(topic);
    }

    /// while offline every publish fails
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, Error> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.inner
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .insert(id, tx);
        self.inner.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        let stream = async_stream::stream! {
            while let Some(msg) = rx.recv().await {
                yield msg;
            }
        };
        Ok(Subscription {
            id,
            topic: topic.to_string(),
            stream: Box::pin(stream),
        })
    }

    async fn publish(&self, topic: &str, message: Broadcast) -> Result<(), Error> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(Error::FailedToSendSignal("bus is offline".into()));
        }
        self.inner
            .history
            .write()
            .push((topic.to_string(), message.clone()));
        let mut topics = self.inner.topics.write();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|_, tx| tx.send(message.clone()).is_ok());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, id: Uuid) -> Result<(), Error> {
        let mut topics = self.inner.topics.write();
        if let Some(subs) = topics.get_mut(topic) {
            subs.remove(&id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
        Ok(())
    }
}
