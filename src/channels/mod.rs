//! Channel system.
//!
//! A channel is one side of the bridge: the YouTube channel ingests live
//! chat and publishes inbound messages on the bus; the avatar channel takes
//! outbound replies off the bus and fans them out to connected browser
//! clients. Both implement the same lifecycle contract.

mod base;

pub mod avatar;
pub mod youtube;

pub use avatar::AvatarChannel;
pub use base::ChannelCore;
pub use youtube::YouTubeChannel;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bus::OutboundMessage;
use crate::error::ChannelError;

/// Lifecycle contract shared by every channel.
///
/// `start` receives the channel's parent cancellation scope; the channel
/// derives its own sub-scopes from it and `stop` tears everything down.
/// Both must be idempotent.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, ctx: &CancellationToken) -> Result<(), ChannelError>;

    async fn stop(&self) -> Result<(), ChannelError>;

    /// Deliver an agent reply to this channel.
    async fn send(&self, msg: OutboundMessage) -> Result<(), ChannelError>;

    /// True iff the allow-list is empty or contains `sender_id`.
    fn is_allowed(&self, sender_id: &str) -> bool;
}
