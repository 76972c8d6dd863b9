//! Message bus for decoupled communication.
//!
//! A dual-queue system routing inbound chat events toward the agent and
//! outbound agent replies toward sink channels. Channels never call each
//! other directly; everything crosses the bus.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

/// A message arriving from an external chat source, bound for the agent.
///
/// Immutable once published.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Name of the channel that produced the message.
    pub channel: String,
    /// Stable sender identity (used for allow-listing).
    pub sender_id: String,
    /// Conversation identity within the channel; may be empty.
    pub chat_id: String,
    pub content: String,
    pub metadata: HashMap<String, String>,
}

/// An agent reply bound for a sink channel, addressed by channel name.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
}

/// Process-local publish/subscribe hub.
///
/// Both queues are bounded; publishing awaits queue space so a stalled
/// consumer applies backpressure to producers instead of growing memory.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    /// Publish a chat event toward the agent.
    pub async fn publish_inbound(&self, msg: InboundMessage) {
        if self.inbound_tx.send(msg).await.is_err() {
            tracing::warn!("inbound consumer gone, message dropped");
        }
    }

    /// Publish an agent reply toward its sink channel.
    pub async fn publish_outbound(&self, msg: OutboundMessage) {
        if self.outbound_tx.send(msg).await.is_err() {
            tracing::warn!("outbound router gone, message dropped");
        }
    }

    /// Take the inbound consumer end. Yields `None` after the first call.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.lock().expect("bus lock poisoned").take()
    }

    /// Take the outbound consumer end. Yields `None` after the first call.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<OutboundMessage>> {
        self.outbound_rx.lock().expect("bus lock poisoned").take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inbound_roundtrip() {
        let bus = MessageBus::new(8);
        let mut rx = bus.take_inbound().unwrap();

        bus.publish_inbound(InboundMessage {
            channel: "youtube".to_string(),
            sender_id: "UCabc".to_string(),
            chat_id: "chat1".to_string(),
            content: "hello".to_string(),
            metadata: HashMap::new(),
        })
        .await;

        let got = rx.recv().await.unwrap();
        assert_eq!(got.channel, "youtube");
        assert_eq!(got.sender_id, "UCabc");
        assert_eq!(got.content, "hello");
    }

    #[tokio::test]
    async fn test_receivers_can_only_be_taken_once() {
        let bus = MessageBus::new(8);
        assert!(bus.take_inbound().is_some());
        assert!(bus.take_inbound().is_none());
        assert!(bus.take_outbound().is_some());
        assert!(bus.take_outbound().is_none());
    }

    #[tokio::test]
    async fn test_publish_without_consumer_does_not_block() {
        let bus = MessageBus::new(1);
        let rx = bus.take_outbound().unwrap();
        drop(rx);

        // Receiver dropped: publish must return, not hang.
        bus.publish_outbound(OutboundMessage {
            channel: "aituber".to_string(),
            chat_id: String::new(),
            content: "x".to_string(),
        })
        .await;
    }
}
