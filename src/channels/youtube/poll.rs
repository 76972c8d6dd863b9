//! Polling tasks and the shared dispatch pipeline.
//!
//! Everything here runs inside the polling cancellation scope. Page-token
//! cursors are locals of their loops, so the main poll and the monetization
//! sub-poll can never read each other's pagination state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bus::InboundMessage;

use super::api;
use super::innertube::{InnerTubeError, InnerTubeSession};
use super::message::ChatMessage;
use super::{filter, select, YouTubeShared};

const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const SCRAPE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

impl YouTubeShared {
    /// Timer-driven REST poll loop. The first tick fires immediately.
    pub(crate) async fn rest_poll_loop(self: Arc<Self>, poll: CancellationToken) {
        let live_chat_id = self.stream_state().live_chat_id.clone();
        let mut page_token: Option<String> = None;

        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.cancelled() => {
                    tracing::info!("poll loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if self.poll_once(&live_chat_id, &mut page_token).await {
                self.on_stream_ended().await;
                return;
            }
        }
    }

    /// One REST poll. Returns true when the stream has ended.
    async fn poll_once(&self, live_chat_id: &str, page_token: &mut Option<String>) -> bool {
        let resp = match self
            .api
            .live_chat_messages(live_chat_id, page_token.as_deref())
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                // Transient; a single failed poll is tolerated.
                tracing::error!(error = %e, "failed to fetch live chat messages");
                return false;
            }
        };

        if let Some(err) = &resp.error {
            return api::handle_api_error(err);
        }

        if !resp.next_page_token.is_empty() {
            *page_token = Some(resp.next_page_token.clone());
        }
        if resp.polling_interval_millis > 0 {
            let recommended = resp.polling_interval_millis / 1000;
            if recommended > self.config.poll_interval_seconds {
                tracing::debug!(
                    recommended_ms = resp.polling_interval_millis,
                    configured_secs = self.config.poll_interval_seconds,
                    "server recommends a longer poll interval"
                );
            }
        }

        let messages: Vec<ChatMessage> = resp
            .items
            .into_iter()
            .filter_map(|item| item.into_chat_message())
            .collect();
        self.pipeline(messages).await;
        false
    }

    /// Cooperative scrape poll loop. Falls back to the REST transport after
    /// repeated failures; a stream-over signal runs the stream-end
    /// transition.
    pub(crate) async fn scrape_poll_loop(
        self: Arc<Self>,
        mut session: InnerTubeSession,
        poll: CancellationToken,
    ) {
        let mut consecutive_errors = 0u32;

        loop {
            let Some((returned, result)) = fetch_with_cancel(session, &poll).await else {
                tracing::info!("scrape poll stopped");
                return;
            };
            session = returned;

            match result {
                Ok(messages) => {
                    consecutive_errors = 0;
                    if messages.is_empty() {
                        continue;
                    }
                    self.pipeline(messages).await;
                }
                Err(InnerTubeError::StreamOver) => {
                    tracing::info!("scrape transport: live stream over");
                    self.on_stream_ended().await;
                    return;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        error = %e,
                        consecutive_errors,
                        "scrape poll error"
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        tracing::error!(
                            errors = consecutive_errors,
                            "scrape transport failed repeatedly, falling back to REST"
                        );
                        poll.cancel();
                        let parent = self.tasks().parent.clone();
                        if let Some(parent) = parent {
                            self.fallback_to_data_api(&parent).await;
                        }
                        return;
                    }
                    tokio::select! {
                        _ = poll.cancelled() => return,
                        _ = tokio::time::sleep(SCRAPE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
    }

    /// Low-frequency REST poll for monetization events only. Runs next to
    /// the scrape loop with its own page-token cursor; on quota exhaustion
    /// it stops itself and leaves regular chat untouched.
    pub(crate) async fn superchat_poll_loop(self: Arc<Self>, poll: CancellationToken) {
        let live_chat_id = self.stream_state().live_chat_id.clone();
        let mut page_token: Option<String> = None;

        let period = Duration::from_secs(self.config.superchat_poll_seconds);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = period.as_secs(),
            live_chat_id = %live_chat_id,
            "super-chat poll started"
        );

        loop {
            tokio::select! {
                _ = poll.cancelled() => {
                    tracing::info!("super-chat poll stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let resp = match self
                .api
                .live_chat_messages(&live_chat_id, page_token.as_deref())
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(error = %e, "super-chat poll error");
                    continue;
                }
            };

            if let Some(err) = &resp.error {
                if api::is_quota_exceeded(err) {
                    tracing::warn!(
                        "super-chat poll stopped: API quota exceeded, regular chat continues"
                    );
                    return;
                }
                if api::handle_api_error(err) {
                    return;
                }
                continue;
            }

            if !resp.next_page_token.is_empty() {
                page_token = Some(resp.next_page_token.clone());
            }

            for item in resp.items {
                if item.snippet.kind == "superChatEvent" {
                    if let Some(m) = item.into_chat_message() {
                        self.process_message(m).await;
                    }
                }
            }
        }
    }

    /// Filter, then either buffer (accumulation mode) or select and
    /// dispatch immediately.
    pub(crate) async fn pipeline(&self, messages: Vec<ChatMessage>) {
        let filtered = filter::pre_filter(&self.config.filter, messages);
        if filtered.is_empty() {
            return;
        }

        if self.config.accumulate_comments {
            self.append_to_buffer(filtered);
            return;
        }

        let selected = select::select_comments(&self.config.selection, filtered);
        if self.config.batch_comments && selected.len() > 1 {
            self.batch_and_publish(selected).await;
        } else {
            for m in selected {
                self.process_message(m).await;
            }
        }
    }

    pub(crate) async fn process_message(&self, m: ChatMessage) {
        if m.display_text.is_empty() {
            return;
        }
        let formatted = self
            .config
            .message_format
            .replace("{author}", &m.author.name)
            .replace("{message}", &m.display_text);

        let mut metadata = HashMap::new();
        metadata.insert("author_channel_id".to_string(), m.author.id.clone());
        metadata.insert("author_name".to_string(), m.author.name.clone());
        metadata.insert("message_id".to_string(), m.id.clone());
        metadata.insert("published_at".to_string(), m.published_at.clone());
        if m.author.is_owner {
            metadata.insert("is_owner".to_string(), "true".to_string());
        }
        if m.author.is_moderator {
            metadata.insert("is_moderator".to_string(), "true".to_string());
        }
        if let Some(sc) = &m.super_chat {
            metadata.insert("super_chat_amount".to_string(), sc.amount_display.clone());
        }

        let chat_id = self.stream_state().live_chat_id.clone();
        self.core
            .handle_message(&m.author.id, &chat_id, formatted, metadata)
            .await;
    }

    /// Combine several comments into one composite prompt and publish it
    /// directly, bypassing the per-sender allow-list (the batch members
    /// already passed the filter).
    pub(crate) async fn batch_and_publish(&self, messages: Vec<ChatMessage>) {
        let mut body = String::from("[YouTube コメントまとめ]\n");
        for m in &messages {
            body.push_str(&m.author.name);
            body.push_str(": ");
            body.push_str(&m.display_text);
            body.push('\n');
        }
        body.push_str("---\n上記のコメントにまとめて応答してください。");

        let chat_id = self.stream_state().live_chat_id.clone();
        let mut metadata = HashMap::new();
        metadata.insert("batch_size".to_string(), messages.len().to_string());

        self.core
            .bus()
            .publish_inbound(InboundMessage {
                channel: self.core.name().to_string(),
                sender_id: "youtube-batch".to_string(),
                chat_id,
                content: body,
                metadata,
            })
            .await;
    }

    fn append_to_buffer(&self, messages: Vec<ChatMessage>) {
        let (added, total) = {
            let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
            let added = messages.len();
            buffer.extend(messages);
            (added, buffer.len())
        };
        tracing::debug!(added, total, "comments buffered");
        self.buffer_notify.notify_one();
    }

    /// TTS-synchronized batching cadence: wait for a first comment, hold at
    /// least the minimum window, then race the TTS-ready signal against the
    /// remaining maximum window.
    pub(crate) async fn flush_loop(self: Arc<Self>, poll: CancellationToken) {
        let min_wait = Duration::from_secs(self.config.min_accumulate_seconds);
        let max_wait = Duration::from_secs(self.config.max_accumulate_seconds);
        let has_signal = self.tts_ready.lock().expect("tts lock poisoned").is_some();

        tracing::info!(
            min_wait_secs = min_wait.as_secs(),
            max_wait_secs = max_wait.as_secs(),
            has_tts_signal = has_signal,
            "comment accumulator started"
        );

        loop {
            tokio::select! {
                _ = poll.cancelled() => return,
                _ = self.buffer_notify.notified() => {}
            }

            tokio::select! {
                _ = poll.cancelled() => return,
                _ = tokio::time::sleep(min_wait) => {}
            }

            let tts = self.tts_ready.lock().expect("tts lock poisoned").clone();
            if let Some(tts) = tts {
                let remaining = max_wait.saturating_sub(min_wait);
                if !remaining.is_zero() {
                    tokio::select! {
                        _ = poll.cancelled() => return,
                        _ = tts.notified() => {}
                        _ = tokio::time::sleep(remaining) => {
                            tracing::debug!("max accumulate timeout, forcing flush");
                        }
                    }
                }
            }

            self.flush_comment_buffer().await;
        }
    }

    async fn flush_comment_buffer(&self) {
        let comments = {
            let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        let total = comments.len();
        let selected = select::select_comments(&self.config.selection, comments);
        if selected.is_empty() {
            return;
        }

        tracing::info!(
            total_buffered = total,
            selected = selected.len(),
            "flushing accumulated comments"
        );

        if selected.len() > 1 {
            self.batch_and_publish(selected).await;
        } else if let Some(m) = selected.into_iter().next() {
            self.process_message(m).await;
        }
    }
}

/// Run one blocking fetch in a helper task and race it against
/// cancellation. The completion channel is buffered, so the helper always
/// finishes its single send and exits even when the caller has gone.
/// Returns `None` on cancellation.
async fn fetch_with_cancel(
    mut session: InnerTubeSession,
    poll: &CancellationToken,
) -> Option<(InnerTubeSession, Result<Vec<ChatMessage>, InnerTubeError>)> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = session.fetch_chat().await;
        let _ = tx.send((session, result));
    });

    tokio::select! {
        _ = poll.cancelled() => None,
        out = rx => out.ok(),
    }
}
