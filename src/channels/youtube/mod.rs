//! YouTube Live chat ingestion channel.
//!
//! Resolves the active live stream for a configured video or channel, polls
//! its chat over one of two transports, pushes survivors of the quality
//! filter through selection/batching, and publishes them inbound on the
//! bus. When a stream ends the channel quietly hunts for the next one.
//!
//! ```text
//! watch page ──┐                      ┌─ filter ─ select ─ batch ─► bus
//!              ├─► poll loop ─ convert┤
//! Data API  ───┘                      └─ accumulate ─ flush ──────► bus
//! ```

pub mod api;
pub mod feed;
pub mod filter;
pub mod innertube;
pub mod message;
mod poll;
pub mod select;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::bus::{MessageBus, OutboundMessage};
use crate::channels::{Channel, ChannelCore};
use crate::config::{ChatSource, YouTubeConfig};
use crate::error::ChannelError;

use self::api::{RestError, YouTubeApi};
use self::feed::FeedError;
use self::innertube::{InnerTubeError, InnerTubeSession};
use self::message::ChatMessage;

const CHANNEL_NAME: &str = "youtube";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_INITIAL: Duration = Duration::from_secs(60);
const RECONNECT_MAX: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
enum ResolveError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Api(#[from] RestError),

    #[error("no active live stream found for channel {0}")]
    NoLiveStream(String),
}

/// Mutable stream identity. Owned by the single active poll session at any
/// moment; Start, stream-end and transport fallback all cancel the previous
/// session before touching it.
#[derive(Default)]
pub(crate) struct StreamState {
    pub(crate) video_id: String,
    pub(crate) live_chat_id: String,
}

/// Cancellation scopes for the channel's tasks. The reconnect loop hangs
/// off the parent scope, never the polling sub-scope, so a stream-end
/// cancellation cannot take it down.
#[derive(Default)]
pub(crate) struct TaskControl {
    pub(crate) parent: Option<CancellationToken>,
    pub(crate) poll: Option<CancellationToken>,
    pub(crate) reconnect: Option<CancellationToken>,
}

pub(crate) struct YouTubeShared {
    pub(crate) core: ChannelCore,
    pub(crate) config: YouTubeConfig,
    pub(crate) api: YouTubeApi,
    pub(crate) http: reqwest::Client,
    pub(crate) stream: StdMutex<StreamState>,
    pub(crate) control: StdMutex<TaskControl>,
    /// Accumulation buffer; drained read-and-clear under one lock hold.
    pub(crate) buffer: StdMutex<Vec<ChatMessage>>,
    pub(crate) buffer_notify: Notify,
    /// TTS-ready signal attached from the avatar channel, if any.
    pub(crate) tts_ready: StdMutex<Option<Arc<Notify>>>,
}

pub struct YouTubeChannel {
    shared: Arc<YouTubeShared>,
}

impl YouTubeChannel {
    pub fn new(config: YouTubeConfig, bus: Arc<MessageBus>) -> Result<Self, ChannelError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ChannelError::StartupFailed {
                name: CHANNEL_NAME.to_string(),
                reason: format!("failed to build http client: {e}"),
            })?;
        let api = YouTubeApi::new(
            http.clone(),
            config.api_base.clone(),
            config.api_key.clone().unwrap_or_default(),
        );

        let stream = StreamState {
            video_id: config.video_id.clone(),
            live_chat_id: String::new(),
        };

        Ok(Self {
            shared: Arc::new(YouTubeShared {
                core: ChannelCore::new(CHANNEL_NAME, bus, config.allow_from.clone()),
                config,
                api,
                http,
                stream: StdMutex::new(stream),
                control: StdMutex::new(TaskControl::default()),
                buffer: StdMutex::new(Vec::new()),
                buffer_notify: Notify::new(),
                tts_ready: StdMutex::new(None),
            }),
        })
    }

    /// Attach the avatar channel's TTS-ready signal so accumulation flushes
    /// ride the speech cadence.
    pub fn set_tts_ready(&self, signal: Arc<Notify>) {
        *self.shared.tts_ready.lock().expect("tts lock poisoned") = Some(signal);
    }

    pub fn is_running(&self) -> bool {
        self.shared.core.is_running()
    }
}

#[async_trait]
impl Channel for YouTubeChannel {
    fn name(&self) -> &str {
        self.shared.core.name()
    }

    async fn start(&self, ctx: &CancellationToken) -> Result<(), ChannelError> {
        let shared = self.shared.clone();
        shared.tasks().parent = Some(ctx.clone());

        let needs_resolution = shared.stream_state().video_id.is_empty();
        if needs_resolution && !shared.config.channel_id.is_empty() {
            match shared.resolve_video_id().await {
                Ok(video_id) => {
                    shared.stream_state().video_id = video_id;
                }
                Err(e) => {
                    tracing::warn!(
                        channel_id = %shared.config.channel_id,
                        error = %e,
                        "no active live stream found, will retry in background"
                    );
                    let token = ctx.child_token();
                    shared.tasks().reconnect = Some(token.clone());
                    tokio::spawn(shared.clone().reconnect_loop(token));
                    return Ok(());
                }
            }
        }

        shared.connect_to_live_chat(ctx).await
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        let (reconnect, poll) = {
            let mut tasks = self.shared.tasks();
            (tasks.reconnect.take(), tasks.poll.take())
        };
        if let Some(token) = reconnect {
            token.cancel();
        }
        if let Some(token) = poll {
            token.cancel();
        }
        self.shared.core.set_running(false);
        tracing::info!("youtube channel stopped");
        Ok(())
    }

    /// Bridge an agent reply to the configured forward channel. This
    /// channel never posts back into the live chat itself.
    async fn send(&self, msg: OutboundMessage) -> Result<(), ChannelError> {
        let config = &self.shared.config;
        if config.forward_channel.is_empty() || config.forward_chat_id.is_empty() {
            tracing::warn!("no forward channel configured, dropping response");
            return Ok(());
        }
        self.shared
            .core
            .bus()
            .publish_outbound(OutboundMessage {
                channel: config.forward_channel.clone(),
                chat_id: config.forward_chat_id.clone(),
                content: msg.content,
            })
            .await;
        Ok(())
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        self.shared.core.is_allowed(sender_id)
    }
}

impl YouTubeShared {
    pub(crate) fn stream_state(&self) -> MutexGuard<'_, StreamState> {
        self.stream.lock().expect("stream state lock poisoned")
    }

    pub(crate) fn tasks(&self) -> MutexGuard<'_, TaskControl> {
        self.control.lock().expect("task control lock poisoned")
    }

    /// Select a transport and launch the polling tasks for the currently
    /// resolved video.
    async fn connect_to_live_chat(
        self: &Arc<Self>,
        parent: &CancellationToken,
    ) -> Result<(), ChannelError> {
        match self.config.chat_source {
            ChatSource::Scrape => self.connect_scrape(parent).await,
            ChatSource::Rest => self.connect_rest(parent).await,
        }
    }

    async fn connect_scrape(
        self: &Arc<Self>,
        parent: &CancellationToken,
    ) -> Result<(), ChannelError> {
        let video_id = self.stream_state().video_id.clone();

        let session =
            match InnerTubeSession::init(&self.config.watch_base, &video_id, parent).await {
                Ok(session) => session,
                Err(InnerTubeError::Cancelled) => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "scrape init failed, trying REST fallback");
                    self.fallback_to_data_api(parent).await;
                    return Ok(());
                }
            };

        // The monetization sub-poll needs a live-chat ID (1 unit).
        if self.config.api_key.is_some() && self.config.superchat_poll_seconds > 0 {
            if !self.config.live_chat_id.is_empty() {
                self.stream_state().live_chat_id = self.config.live_chat_id.clone();
            } else {
                match self.api.active_live_chat_id(&video_id).await {
                    Ok(id) if !id.is_empty() => {
                        self.stream_state().live_chat_id = id;
                    }
                    Ok(_) => {
                        tracing::warn!("video has no active live chat, super-chat polling disabled");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "could not get live chat ID for super-chat polling");
                    }
                }
            }
        }

        let superchat_enabled = self.config.superchat_poll_seconds > 0
            && !self.stream_state().live_chat_id.is_empty();

        tracing::info!(
            video_id,
            superchat_poll = superchat_enabled,
            "connected via scrape transport"
        );

        let poll = parent.child_token();
        self.tasks().poll = Some(poll.clone());
        self.core.set_running(true);

        tokio::spawn(self.clone().scrape_poll_loop(session, poll.clone()));
        if superchat_enabled {
            tokio::spawn(self.clone().superchat_poll_loop(poll.clone()));
        }
        if self.config.accumulate_comments {
            tokio::spawn(self.clone().flush_loop(poll));
        }
        Ok(())
    }

    async fn connect_rest(
        self: &Arc<Self>,
        parent: &CancellationToken,
    ) -> Result<(), ChannelError> {
        let live_chat_id = if !self.config.live_chat_id.is_empty() {
            tracing::info!(
                live_chat_id = %self.config.live_chat_id,
                "using directly configured live chat ID"
            );
            self.config.live_chat_id.clone()
        } else {
            let video_id = self.stream_state().video_id.clone();
            let id = self.api.active_live_chat_id(&video_id).await.map_err(|e| {
                ChannelError::StartupFailed {
                    name: CHANNEL_NAME.to_string(),
                    reason: format!("failed to get live chat ID: {e}"),
                }
            })?;
            if id.is_empty() {
                return Err(ChannelError::StartupFailed {
                    name: CHANNEL_NAME.to_string(),
                    reason: format!("video {video_id} is not currently live streaming"),
                });
            }
            id
        };

        self.stream_state().live_chat_id = live_chat_id.clone();
        tracing::info!(live_chat_id = %live_chat_id, "connected to live chat");

        let poll = parent.child_token();
        self.tasks().poll = Some(poll.clone());
        self.core.set_running(true);

        tokio::spawn(self.clone().rest_poll_loop(poll.clone()));
        if self.config.accumulate_comments {
            tokio::spawn(self.clone().flush_loop(poll));
        }
        Ok(())
    }

    /// Feed lookup first (0 quota), search as the expensive last resort.
    async fn resolve_video_id(&self) -> Result<String, ResolveError> {
        match self.resolve_via_feed().await {
            Ok(video_id) => return Ok(video_id),
            Err(e) => {
                tracing::debug!(
                    channel_id = %self.config.channel_id,
                    error = %e,
                    "feed-based detection found no live stream"
                );
            }
        }
        match self.api.search_live(&self.config.channel_id).await {
            Ok(video_id) => Ok(video_id),
            Err(e) => {
                tracing::debug!(error = %e, "live search found nothing");
                Err(ResolveError::NoLiveStream(self.config.channel_id.clone()))
            }
        }
    }

    async fn resolve_via_feed(&self) -> Result<String, ResolveError> {
        let ids =
            feed::recent_video_ids(&self.http, &self.config.feed_base, &self.config.channel_id)
                .await?;
        tracing::debug!(
            channel_id = %self.config.channel_id,
            candidate_ids = %ids.join(","),
            "feed fetched, checking videos for live status"
        );
        match self.api.find_active_live(&ids).await? {
            Some(candidate) => {
                tracing::info!(
                    channel_id = %self.config.channel_id,
                    video_id = %candidate.video_id,
                    title = %candidate.title,
                    "auto-detected live stream via feed"
                );
                Ok(candidate.video_id)
            }
            None => Err(ResolveError::NoLiveStream(self.config.channel_id.clone())),
        }
    }

    /// Waits for a live stream to appear, backing off exponentially. After
    /// the first full (possibly quota-spending) attempt fails, later
    /// attempts use only the free feed lookup.
    async fn reconnect_loop(self: Arc<Self>, token: CancellationToken) {
        let mut interval = RECONNECT_INITIAL;
        let mut feed_only = false;

        tracing::info!(
            channel_id = %self.config.channel_id,
            retry_interval_secs = interval.as_secs(),
            "waiting for live stream"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("reconnect loop stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let resolved = if feed_only {
                self.resolve_via_feed().await
            } else {
                let result = self.resolve_video_id().await;
                if result.is_err() {
                    feed_only = true;
                    tracing::info!(
                        channel_id = %self.config.channel_id,
                        "switching to feed-only detection to preserve API quota"
                    );
                }
                result
            };

            let video_id = match resolved {
                Ok(video_id) => video_id,
                Err(_) => {
                    tracing::debug!(
                        channel_id = %self.config.channel_id,
                        next_interval_secs = interval.as_secs(),
                        feed_only,
                        "no live stream yet"
                    );
                    if interval < RECONNECT_MAX {
                        interval = (interval * 2).min(RECONNECT_MAX);
                    }
                    continue;
                }
            };

            self.stream_state().video_id = video_id.clone();
            let parent = self.tasks().parent.clone();
            let Some(parent) = parent else { return };
            if let Err(e) = self.connect_to_live_chat(&parent).await {
                tracing::error!(video_id, error = %e, "failed to connect to new live stream");
                continue;
            }
            return;
        }
    }

    /// Stream-end transition: discard buffered comments, tear down the
    /// polling session, and (with a channel ID configured) start hunting
    /// for the next stream under the parent scope.
    pub(crate) fn on_stream_ended(
        self: &Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.discard_buffer();

            let poll = self.tasks().poll.take();
            if let Some(token) = poll {
                token.cancel();
            }
            self.core.set_running(false);

            if self.config.channel_id.is_empty() {
                tracing::warn!("stream ended; set YT_CHANNEL_ID to enable auto-reconnect");
                return;
            }

            tracing::info!(
                channel_id = %self.config.channel_id,
                "stream ended, will search for new stream"
            );
            // Clear before reconnecting so a stale ID cannot be reused.
            self.stream_state().video_id.clear();

            let parent = self.tasks().parent.clone();
            if let Some(parent) = parent {
                let token = parent.child_token();
                self.tasks().reconnect = Some(token.clone());
                tokio::spawn(self.clone().reconnect_loop(token));
            }
        })
    }

    /// Switch from the scrape transport to REST polling. Requires an API
    /// key; without one the stream-end transition runs instead.
    pub(crate) async fn fallback_to_data_api(self: &Arc<Self>, parent: &CancellationToken) {
        if self.config.api_key.is_none() {
            tracing::error!("cannot fall back to REST transport: no API key configured");
            self.on_stream_ended().await;
            return;
        }

        if self.stream_state().live_chat_id.is_empty() {
            let video_id = self.stream_state().video_id.clone();
            match self.api.active_live_chat_id(&video_id).await {
                Ok(id) if !id.is_empty() => {
                    self.stream_state().live_chat_id = id;
                }
                Ok(_) => {
                    tracing::error!("REST fallback failed: video has no active live chat");
                    self.on_stream_ended().await;
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "REST fallback failed: cannot get live chat ID");
                    self.on_stream_ended().await;
                    return;
                }
            }
        }

        tracing::info!(
            live_chat_id = %self.stream_state().live_chat_id,
            "switched to REST polling (fallback mode)"
        );

        let poll = parent.child_token();
        self.tasks().poll = Some(poll.clone());
        self.core.set_running(true);

        tokio::spawn(self.clone().rest_poll_loop(poll.clone()));
        if self.config.accumulate_comments {
            tokio::spawn(self.clone().flush_loop(poll));
        }
    }

    pub(crate) fn discard_buffer(&self) {
        let count = {
            let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
            let count = buffer.len();
            buffer.clear();
            count
        };
        if count > 0 {
            tracing::info!(count, "discarded comment buffer");
        }
    }
}

#[cfg(test)]
pub(crate) fn test_shared(
    config: YouTubeConfig,
) -> (
    Arc<YouTubeShared>,
    tokio::sync::mpsc::Receiver<crate::bus::InboundMessage>,
) {
    let bus = Arc::new(MessageBus::new(64));
    let rx = bus.take_inbound().unwrap();
    let channel = YouTubeChannel::new(config, bus).unwrap();
    (channel.shared, rx)
}

#[cfg(test)]
pub(crate) fn test_config() -> YouTubeConfig {
    YouTubeConfig {
        chat_source: ChatSource::Scrape,
        api_key: None,
        video_id: "vid".to_string(),
        channel_id: String::new(),
        live_chat_id: String::new(),
        poll_interval_seconds: 20,
        superchat_poll_seconds: 0,
        forward_channel: String::new(),
        forward_chat_id: String::new(),
        message_format: "[YT] {author}: {message}".to_string(),
        allow_from: Vec::new(),
        filter: crate::config::FilterConfig::default(),
        selection: crate::config::SelectionConfig::default(),
        batch_comments: false,
        accumulate_comments: false,
        min_accumulate_seconds: 3,
        max_accumulate_seconds: 30,
        api_base: "http://127.0.0.1:0".to_string(),
        feed_base: "http://127.0.0.1:0".to_string(),
        watch_base: "http://127.0.0.1:0".to_string(),
    }
}
