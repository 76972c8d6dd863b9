//! Shared channel state: name, running flag, allow-list, bus handle.
//!
//! Channels embed this instead of inheriting from a base class; the trait
//! methods delegate to it where the behavior is common.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bus::{InboundMessage, MessageBus};

pub struct ChannelCore {
    name: &'static str,
    running: AtomicBool,
    allow_from: Vec<String>,
    bus: Arc<MessageBus>,
}

impl ChannelCore {
    pub fn new(name: &'static str, bus: Arc<MessageBus>, allow_from: Vec<String>) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
            allow_from,
            bus,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn is_allowed(&self, sender_id: &str) -> bool {
        self.allow_from.is_empty() || self.allow_from.iter().any(|a| a == sender_id)
    }

    /// The guarded inbound path: consults the allow-list and publishes on
    /// the bus. Batch dispatch is the only sanctioned bypass of this guard.
    pub async fn handle_message(
        &self,
        sender_id: &str,
        chat_id: &str,
        content: String,
        metadata: HashMap<String, String>,
    ) {
        if !self.is_allowed(sender_id) {
            tracing::debug!(
                channel = self.name,
                sender_id,
                "sender not in allow-list, dropping message"
            );
            return;
        }
        self.bus
            .publish_inbound(InboundMessage {
                channel: self.name.to_string(),
                sender_id: sender_id.to_string(),
                chat_id: chat_id.to_string(),
                content,
                metadata,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_with_allowlist(allow: Vec<String>) -> (ChannelCore, Arc<MessageBus>) {
        let bus = Arc::new(MessageBus::new(8));
        (ChannelCore::new("test", bus.clone(), allow), bus)
    }

    #[test]
    fn test_empty_allowlist_permits_all() {
        let (core, _bus) = core_with_allowlist(vec![]);
        assert!(core.is_allowed("anyone"));
        assert!(core.is_allowed(""));
    }

    #[test]
    fn test_allowlist_filters_senders() {
        let (core, _bus) = core_with_allowlist(vec!["UCgood".to_string()]);
        assert!(core.is_allowed("UCgood"));
        assert!(!core.is_allowed("UCbad"));
    }

    #[tokio::test]
    async fn test_handle_message_drops_disallowed_sender() {
        let (core, bus) = core_with_allowlist(vec!["UCgood".to_string()]);
        let mut rx = bus.take_inbound().unwrap();

        core.handle_message("UCbad", "c", "nope".to_string(), HashMap::new())
            .await;
        core.handle_message("UCgood", "c", "yes".to_string(), HashMap::new())
            .await;

        let got = rx.recv().await.unwrap();
        assert_eq!(got.content, "yes");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_running_flag() {
        let (core, _bus) = core_with_allowlist(vec![]);
        assert!(!core.is_running());
        core.set_running(true);
        assert!(core.is_running());
        core.set_running(false);
        assert!(!core.is_running());
    }
}
