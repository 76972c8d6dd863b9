//! stagebridge — a live-stream chat to avatar bridge.
//!
//! Ingests YouTube Live chat (scraped or via the Data API), filters and
//! shapes the traffic, hands it to a downstream agent over a message bus,
//! and fans the agent's emotion-tagged replies out to browser avatar
//! clients over WebSocket, paced by their speech-synthesis completion
//! callbacks.

pub mod bus;
pub mod channels;
pub mod config;
pub mod error;

pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use channels::{AvatarChannel, Channel, YouTubeChannel};
pub use config::Config;
