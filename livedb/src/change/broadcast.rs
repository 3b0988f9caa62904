use super::{ChangeRecord, WireChangeRecord};
use crate::error::Result;
use crate::schema::SchemaRegistry;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What travels between database handles that share a store: the record
/// serialized as JSON, addressed to a namespace (the store path) and tagged
/// with the sending handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    pub namespace: String,
    pub origin: String,
    pub record: String,
}

impl ChangeEnvelope {
    pub fn wrap(namespace: &str, origin: &str, record: &ChangeRecord) -> Result<Self> {
        Ok(ChangeEnvelope {
            namespace: namespace.to_string(),
            origin: origin.to_string(),
            record: serde_json::to_string(&record.to_wire())?,
        })
    }

    /// Decode the record for a receiver. Envelopes sent by `origin` itself
    /// or addressed to another namespace yield `None`, as do unknown classes.
    pub fn open(&self, namespace: &str, origin: &str, registry: &SchemaRegistry) -> Result<Option<ChangeRecord>> {
        if self.origin == origin || self.namespace != namespace {
            return Ok(None);
        }
        let wire: WireChangeRecord = serde_json::from_str(&self.record)?;
        ChangeRecord::from_wire(wire, registry)
    }
}

/// Pub/sub transport for change records between database handles, possibly
/// in different processes. Delivery is at-least-once and unordered across
/// senders.
pub trait ChangeBroadcast: Send + Sync {
    fn publish(&self, envelope: ChangeEnvelope) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEnvelope>;
}

/// In-process broadcast, for several handles on one store in one process.
#[derive(Debug, Clone)]
pub struct LocalBroadcastHub {
    sender: broadcast::Sender<ChangeEnvelope>,
}

impl LocalBroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        LocalBroadcastHub { sender }
    }
}

impl Default for LocalBroadcastHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ChangeBroadcast for LocalBroadcastHub {
    fn publish(&self, envelope: ChangeEnvelope) -> Result<()> {
        // send only fails when nobody is subscribed
        if self.sender.send(envelope).is_err() {
            log::trace!("No receivers for change broadcast");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEnvelope> {
        self.sender.subscribe()
    }
}
