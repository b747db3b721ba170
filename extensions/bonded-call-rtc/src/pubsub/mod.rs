//! Named-topic publish/subscribe. The call core only needs three things from the service:
//! subscribing before the other side has (no handshake to create a topic), an
//! acknowledgment once the subscription is live, and best-effort delivery to whoever is
//! subscribed at the time of publishing.

use async_trait::async_trait;
use bonded::error::Error;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod memory;
pub mod realtime;

pub use memory::MemoryPubSub;
pub use realtime::RealtimeClient;

/// One broadcast on a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    pub event: String,
    pub payload: serde_json::Value,
}

pub struct Subscription {
    pub id: Uuid,
    pub topic: String,
    /// ends when the subscription is removed or the service goes away
    pub stream: BoxStream<'static, Broadcast>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}

#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    /// resolves once the service has acknowledged the subscription
    async fn subscribe(&self, topic: &str) -> Result<Subscription, Error>;
    async fn publish(&self, topic: &str, message: Broadcast) -> Result<(), Error>;
    async fn unsubscribe(&self, topic: &str, id: Uuid) -> Result<(), Error>;
}
