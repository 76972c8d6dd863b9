//! Scrape acquisition transport (0 API quota).
//!
//! Bootstraps from the public watch page: the embedded player config yields
//! an API key, a client context, and a live-chat continuation token. Each
//! poll then exchanges the continuation for a batch of messages and the next
//! continuation. The server's `timeoutMs` hint paces the exchange; honoring
//! it means each fetch blocks for several seconds, which is why callers run
//! it behind a cancellation-aware wrapper.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::message::{ChatAuthor, ChatMessage, ChatMessageKind, SuperChatInfo};

const INIT_ATTEMPTS: u32 = 3;
const INIT_BACKOFF: Duration = Duration::from_secs(10);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum InnerTubeError {
    #[error("stream is not live")]
    StreamNotLive,

    #[error("live stream is over")]
    StreamOver,

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("parse failed: {0}")]
    Parse(String),

    #[error("cancelled")]
    Cancelled,
}

/// One scrape session: cookie state, client context, and the current
/// continuation cursor.
pub struct InnerTubeSession {
    http: reqwest::Client,
    watch_base: String,
    api_key: String,
    context: Value,
    continuation: String,
    timeout_ms: u64,
}

impl InnerTubeSession {
    /// Initialize by parsing the watch page. Retries transient failures
    /// with a doubling backoff (10 s, 20 s, 40 s); a not-live stream is
    /// reported immediately.
    pub async fn init(
        watch_base: &str,
        video_id: &str,
        ctx: &CancellationToken,
    ) -> Result<Self, InnerTubeError> {
        let http = build_client(watch_base)?;

        let mut last_err = InnerTubeError::Parse("no attempts made".to_string());
        for attempt in 0..INIT_ATTEMPTS {
            match Self::bootstrap(&http, watch_base, video_id).await {
                Ok(session) => {
                    tracing::info!(video_id, attempt = attempt + 1, "scrape transport initialized");
                    return Ok(session);
                }
                Err(InnerTubeError::StreamNotLive) => return Err(InnerTubeError::StreamNotLive),
                Err(e) => {
                    let wait = INIT_BACKOFF * 2u32.pow(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        wait_secs = wait.as_secs(),
                        error = %e,
                        "scrape init failed, retrying"
                    );
                    last_err = e;
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(InnerTubeError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn bootstrap(
        http: &reqwest::Client,
        watch_base: &str,
        video_id: &str,
    ) -> Result<Self, InnerTubeError> {
        let url = format!("{watch_base}/watch?v={video_id}");
        let resp = http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(InnerTubeError::Parse(format!(
                "watch page returned status {status}"
            )));
        }
        let html = resp.text().await?;

        let api_key = extract_json_string(&html, "INNERTUBE_API_KEY")
            .ok_or_else(|| InnerTubeError::Parse("INNERTUBE_API_KEY not found".to_string()))?;
        let context = extract_json_object(&html, "INNERTUBE_CONTEXT")
            .ok_or_else(|| InnerTubeError::Parse("INNERTUBE_CONTEXT not found".to_string()))?;
        // The page carries continuation tokens for several surfaces; only
        // the one inside the live-chat renderer matters. Its absence means
        // the video has no active chat.
        let continuation = html
            .find("\"liveChatRenderer\"")
            .and_then(|at| extract_json_string(&html[at..], "continuation"))
            .ok_or(InnerTubeError::StreamNotLive)?;

        Ok(Self {
            http: http.clone(),
            watch_base: watch_base.to_string(),
            api_key,
            context,
            continuation,
            timeout_ms: 0,
        })
    }

    /// One continuation exchange. Sleeps for the server's previous pacing
    /// hint before issuing the request, so a single call can block for
    /// several seconds.
    pub async fn fetch_chat(&mut self) -> Result<Vec<ChatMessage>, InnerTubeError> {
        if self.timeout_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.timeout_ms)).await;
        }

        let url = format!(
            "{}/youtubei/v1/live_chat/get_live_chat?key={}&prettyPrint=false",
            self.watch_base, self.api_key
        );
        let body = serde_json::json!({
            "context": self.context,
            "continuation": self.continuation,
        });
        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(InnerTubeError::Parse(format!(
                "get_live_chat returned status {status}"
            )));
        }
        let root: Value = resp
            .json()
            .await
            .map_err(|e| InnerTubeError::Parse(e.to_string()))?;

        let page = parse_live_chat_page(&root)?;
        self.continuation = page.continuation;
        self.timeout_ms = page.timeout_ms;
        Ok(page.messages)
    }
}

struct LiveChatPage {
    messages: Vec<ChatMessage>,
    continuation: String,
    timeout_ms: u64,
}

/// Pull messages and the next cursor out of a `get_live_chat` response.
/// A response with no continuation means the stream is over.
fn parse_live_chat_page(root: &Value) -> Result<LiveChatPage, InnerTubeError> {
    let Some(chat) = root.pointer("/continuationContents/liveChatContinuation") else {
        return Err(InnerTubeError::StreamOver);
    };

    let mut continuation = None;
    let mut timeout_ms = DEFAULT_TIMEOUT_MS;
    if let Some(conts) = chat.get("continuations").and_then(Value::as_array) {
        for cont in conts {
            for key in [
                "timedContinuationData",
                "invalidationContinuationData",
                "reloadContinuationData",
            ] {
                if let Some(data) = cont.get(key) {
                    if let Some(token) = data.get("continuation").and_then(Value::as_str) {
                        continuation = Some(token.to_string());
                    }
                    if let Some(ms) = data.get("timeoutMs").and_then(Value::as_u64) {
                        timeout_ms = ms;
                    }
                }
            }
        }
    }
    let Some(continuation) = continuation else {
        return Err(InnerTubeError::StreamOver);
    };

    let mut messages = Vec::new();
    if let Some(actions) = chat.get("actions").and_then(Value::as_array) {
        for action in actions {
            let Some(item) = action.pointer("/addChatItemAction/item") else {
                continue;
            };
            let converted = if let Some(r) = item.get("liveChatTextMessageRenderer") {
                convert_renderer(r, ChatMessageKind::Text)
            } else if let Some(r) = item.get("liveChatPaidMessageRenderer") {
                convert_renderer(r, ChatMessageKind::SuperChat)
            } else {
                None
            };
            if let Some(m) = converted {
                messages.push(m);
            }
        }
    }

    Ok(LiveChatPage {
        messages,
        continuation,
        timeout_ms,
    })
}

fn convert_renderer(renderer: &Value, kind: ChatMessageKind) -> Option<ChatMessage> {
    let text = runs_text(renderer.pointer("/message/runs"));
    if text.is_empty() {
        return None;
    }

    let str_at = |ptr: &str| {
        renderer
            .pointer(ptr)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let published_at = renderer
        .get("timestampUsec")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(chrono::DateTime::from_timestamp_micros)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();

    let (is_owner, is_moderator, is_sponsor) = author_badges(renderer);

    let super_chat = match kind {
        ChatMessageKind::SuperChat => Some(SuperChatInfo {
            amount_display: str_at("/purchaseAmountText/simpleText"),
            currency: String::new(),
            user_comment: text.clone(),
        }),
        ChatMessageKind::Text => None,
    };

    Some(ChatMessage {
        id: str_at("/id"),
        kind,
        published_at,
        display_text: text,
        author: ChatAuthor {
            id: str_at("/authorExternalChannelId"),
            name: str_at("/authorName/simpleText"),
            is_owner,
            is_moderator,
            is_sponsor,
        },
        super_chat,
    })
}

fn runs_text(runs: Option<&Value>) -> String {
    let Some(runs) = runs.and_then(Value::as_array) else {
        return String::new();
    };
    let mut out = String::new();
    for run in runs {
        if let Some(text) = run.get("text").and_then(Value::as_str) {
            out.push_str(text);
        } else if let Some(shortcut) = run.pointer("/emoji/shortcuts/0").and_then(Value::as_str) {
            out.push_str(shortcut);
        }
    }
    out
}

fn author_badges(renderer: &Value) -> (bool, bool, bool) {
    let (mut owner, mut moderator, mut sponsor) = (false, false, false);
    if let Some(badges) = renderer.get("authorBadges").and_then(Value::as_array) {
        for badge in badges {
            let badge = &badge["liveChatAuthorBadgeRenderer"];
            match badge.pointer("/icon/iconType").and_then(Value::as_str) {
                Some("OWNER") => owner = true,
                Some("MODERATOR") => moderator = true,
                _ => {}
            }
            // Membership badges carry a custom thumbnail instead of an icon.
            if badge.get("customThumbnail").is_some() {
                sponsor = true;
            }
        }
    }
    (owner, moderator, sponsor)
}

fn build_client(watch_base: &str) -> Result<reqwest::Client, InnerTubeError> {
    let url: reqwest::Url = watch_base
        .parse()
        .map_err(|e| InnerTubeError::Parse(format!("bad watch base url: {e}")))?;

    // Benign session cookies keep the consent interstitial and bot checks
    // out of the way.
    let jar = Arc::new(reqwest::cookie::Jar::default());
    jar.add_cookie_str("PREF=tz=Asia/Tokyo; Max-Age=86400", &url);
    let suffix = 100 + rand::thread_rng().gen_range(0..900);
    jar.add_cookie_str(
        &format!("CONSENT=YES+yt.432048971.ja+FX+{suffix}; Max-Age=86400"),
        &url,
    );

    Ok(reqwest::Client::builder()
        .cookie_provider(jar)
        .timeout(HTTP_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?)
}

/// Find `"key":"value"` in raw page source and return the value. Only used
/// for tokens that never contain escapes.
fn extract_json_string(html: &str, key: &str) -> Option<String> {
    let needle = format!("\"{key}\":\"");
    let start = html.find(&needle)? + needle.len();
    let rest = &html[start..];
    let end = rest.find('"')?;
    let value = &rest[..end];
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Find `"key":{...}` in raw page source and parse the balanced object.
fn extract_json_object(html: &str, key: &str) -> Option<Value> {
    let needle = format!("\"{key}\":");
    let start = html.find(&needle)? + needle.len();
    let rest = html[start..].trim_start();
    if !rest.starts_with('{') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&rest[..=i]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SNIPPET: &str = r#"
        <script>var ytcfg = {"INNERTUBE_API_KEY":"AIzaTestKey123",
        "INNERTUBE_CONTEXT":{"client":{"clientName":"WEB","clientVersion":"2.2024","hl":"en"}},
        "other":1};</script>
        <script>var ytInitialData = {"contents":{"liveChatRenderer":
        {"continuations":[{"reloadContinuationData":{"continuation":"0ofMyANt"}}]}}};</script>
    "#;

    #[test]
    fn test_extract_api_key_and_continuation() {
        assert_eq!(
            extract_json_string(PAGE_SNIPPET, "INNERTUBE_API_KEY").unwrap(),
            "AIzaTestKey123"
        );
        assert_eq!(
            extract_json_string(PAGE_SNIPPET, "continuation").unwrap(),
            "0ofMyANt"
        );
        assert!(extract_json_string(PAGE_SNIPPET, "MISSING_KEY").is_none());
    }

    #[test]
    fn test_extract_context_object() {
        let ctx = extract_json_object(PAGE_SNIPPET, "INNERTUBE_CONTEXT").unwrap();
        assert_eq!(
            ctx.pointer("/client/clientName").and_then(Value::as_str),
            Some("WEB")
        );
    }

    #[test]
    fn test_extract_object_handles_nested_braces_and_strings() {
        let html = r#""CTX":{"a":{"b":"val with } brace"},"c":2} trailing"#;
        let obj = extract_json_object(html, "CTX").unwrap();
        assert_eq!(obj["c"], 2);
        assert_eq!(obj.pointer("/a/b").and_then(Value::as_str), Some("val with } brace"));
    }

    fn chat_response(with_continuation: bool) -> Value {
        let mut chat = serde_json::json!({
            "actions": [
                {"addChatItemAction": {"item": {"liveChatTextMessageRenderer": {
                    "id": "msg-1",
                    "timestampUsec": "1700000000000000",
                    "authorName": {"simpleText": "alice"},
                    "authorExternalChannelId": "UC-alice",
                    "message": {"runs": [{"text": "hello "}, {"text": "world"}]}
                }}}},
                {"addChatItemAction": {"item": {"liveChatPaidMessageRenderer": {
                    "id": "paid-1",
                    "authorName": {"simpleText": "bob"},
                    "authorExternalChannelId": "UC-bob",
                    "purchaseAmountText": {"simpleText": "¥500"},
                    "message": {"runs": [{"text": "take my money"}]}
                }}}},
                {"addChatItemAction": {"item": {"liveChatMembershipItemRenderer": {}}}}
            ]
        });
        if with_continuation {
            chat["continuations"] = serde_json::json!([
                {"timedContinuationData": {"continuation": "next-token", "timeoutMs": 7000}}
            ]);
        }
        serde_json::json!({"continuationContents": {"liveChatContinuation": chat}})
    }

    #[test]
    fn test_parse_page_extracts_messages_and_cursor() {
        let page = parse_live_chat_page(&chat_response(true)).unwrap();
        assert_eq!(page.continuation, "next-token");
        assert_eq!(page.timeout_ms, 7000);
        assert_eq!(page.messages.len(), 2);

        let text = &page.messages[0];
        assert_eq!(text.kind, ChatMessageKind::Text);
        assert_eq!(text.display_text, "hello world");
        assert_eq!(text.author.name, "alice");
        assert!(text.published_at.starts_with("2023-11-14"));

        let paid = &page.messages[1];
        assert_eq!(paid.kind, ChatMessageKind::SuperChat);
        assert_eq!(paid.super_chat.as_ref().unwrap().amount_display, "¥500");
    }

    #[test]
    fn test_missing_continuation_is_stream_over() {
        assert!(matches!(
            parse_live_chat_page(&chat_response(false)),
            Err(InnerTubeError::StreamOver)
        ));
        assert!(matches!(
            parse_live_chat_page(&serde_json::json!({"responseContext": {}})),
            Err(InnerTubeError::StreamOver)
        ));
    }

    #[test]
    fn test_owner_and_moderator_badges() {
        let renderer = serde_json::json!({
            "id": "m",
            "authorName": {"simpleText": "mod"},
            "message": {"runs": [{"text": "hi"}]},
            "authorBadges": [
                {"liveChatAuthorBadgeRenderer": {"icon": {"iconType": "MODERATOR"}}},
                {"liveChatAuthorBadgeRenderer": {"customThumbnail": {"thumbnails": []}}}
            ]
        });
        let m = convert_renderer(&renderer, ChatMessageKind::Text).unwrap();
        assert!(m.author.is_moderator);
        assert!(m.author.is_sponsor);
        assert!(!m.author.is_owner);
    }

    #[test]
    fn test_empty_message_runs_are_skipped() {
        let renderer = serde_json::json!({"id": "m", "message": {"runs": []}});
        assert!(convert_renderer(&renderer, ChatMessageKind::Text).is_none());
    }
}
