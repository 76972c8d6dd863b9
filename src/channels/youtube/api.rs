//! YouTube Data API v3 client.
//!
//! Quota-metered REST transport. Covers the three endpoints the channel
//! needs: `videos.list` (live-chat ID lookup, 1 unit), `liveChat/messages`
//! (polling), and `search.list` (live-stream resolution fallback,
//! 100 units).

use serde::Deserialize;
use thiserror::Error;

use super::message::{ChatAuthor, ChatMessage, ChatMessageKind, SuperChatInfo};

#[derive(Debug, Error)]
pub enum RestError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    NotFound(String),
}

/// In-body API error, as Google returns it.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ApiErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LiveChatResponse {
    pub next_page_token: String,
    pub polling_interval_millis: u64,
    pub items: Vec<LiveChatItem>,
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LiveChatItem {
    pub id: String,
    pub snippet: Snippet,
    pub author_details: AuthorDetails,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Snippet {
    #[serde(rename = "type")]
    pub kind: String,
    pub live_chat_id: String,
    pub author_channel_id: String,
    pub published_at: String,
    pub display_message: String,
    pub text_message_details: Option<TextMessageDetails>,
    pub super_chat_details: Option<SuperChatDetails>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TextMessageDetails {
    pub message_text: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SuperChatDetails {
    pub amount_display_string: String,
    pub currency: String,
    pub user_comment: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthorDetails {
    pub channel_id: String,
    pub display_name: String,
    pub is_chat_owner: bool,
    pub is_chat_moderator: bool,
    pub is_chat_sponsor: bool,
}

impl LiveChatItem {
    /// Convert to the canonical pipeline form. Returns `None` for event
    /// types the pipeline does not handle and for empty texts.
    pub fn into_chat_message(self) -> Option<ChatMessage> {
        let kind = match self.snippet.kind.as_str() {
            "textMessageEvent" => ChatMessageKind::Text,
            "superChatEvent" => ChatMessageKind::SuperChat,
            _ => return None,
        };

        let text = match &self.snippet.text_message_details {
            Some(details) => details.message_text.clone(),
            None => self.snippet.display_message.clone(),
        };
        if text.is_empty() {
            return None;
        }

        Some(ChatMessage {
            id: self.id,
            kind,
            published_at: self.snippet.published_at,
            display_text: text,
            author: ChatAuthor {
                id: self.author_details.channel_id,
                name: self.author_details.display_name,
                is_owner: self.author_details.is_chat_owner,
                is_moderator: self.author_details.is_chat_moderator,
                is_sponsor: self.author_details.is_chat_sponsor,
            },
            super_chat: self.snippet.super_chat_details.map(|sc| SuperChatInfo {
                amount_display: sc.amount_display_string,
                currency: sc.currency,
                user_comment: sc.user_comment,
            }),
        })
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct VideosResponse {
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct VideoItem {
    id: String,
    snippet: VideoSnippet,
    live_streaming_details: LiveStreamingDetails,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct VideoSnippet {
    title: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct LiveStreamingDetails {
    active_live_chat_id: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SearchResponse {
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SearchItem {
    id: SearchItemId,
    snippet: VideoSnippet,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SearchItemId {
    video_id: String,
}

/// A live candidate found via `videos.list`.
#[derive(Debug, Clone)]
pub struct LiveCandidate {
    pub video_id: String,
    pub title: String,
}

pub struct YouTubeApi {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl YouTubeApi {
    pub fn new(http: reqwest::Client, api_base: String, api_key: String) -> Self {
        Self {
            http,
            api_base,
            api_key,
        }
    }

    async fn get_checked(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<String, RestError> {
        let resp = self
            .http
            .get(format!("{}{path}", self.api_base))
            .query(query)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(RestError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    /// `videos.list(liveStreamingDetails)` for a single video. Returns the
    /// active live chat ID, which is empty when the video is not live.
    pub async fn active_live_chat_id(&self, video_id: &str) -> Result<String, RestError> {
        let body = self
            .get_checked("/videos", &[("part", "liveStreamingDetails"), ("id", video_id)])
            .await?;
        let parsed: VideosResponse = serde_json::from_str(&body)?;
        let item = parsed
            .items
            .into_iter()
            .next()
            .ok_or_else(|| RestError::NotFound(format!("video not found: {video_id}")))?;
        Ok(item.live_streaming_details.active_live_chat_id)
    }

    /// Batch-check candidate video IDs for an active live chat (1 unit for
    /// the whole batch). Returns the first hit in response order.
    pub async fn find_active_live(
        &self,
        ids: &[String],
    ) -> Result<Option<LiveCandidate>, RestError> {
        let body = self
            .get_checked(
                "/videos",
                &[
                    ("part", "liveStreamingDetails,snippet"),
                    ("id", ids.join(",").as_str()),
                ],
            )
            .await?;
        let parsed: VideosResponse = serde_json::from_str(&body)?;
        Ok(parsed
            .items
            .into_iter()
            .find(|v| !v.live_streaming_details.active_live_chat_id.is_empty())
            .map(|v| LiveCandidate {
                video_id: v.id,
                title: v.snippet.title,
            }))
    }

    /// `search.list` with `eventType=live`. The expensive (100 unit) last
    /// resort for live-stream resolution.
    pub async fn search_live(&self, channel_id: &str) -> Result<String, RestError> {
        let body = self
            .get_checked(
                "/search",
                &[
                    ("part", "id,snippet"),
                    ("channelId", channel_id),
                    ("eventType", "live"),
                    ("type", "video"),
                ],
            )
            .await?;
        let parsed: SearchResponse = serde_json::from_str(&body)?;
        let item = parsed
            .items
            .into_iter()
            .next()
            .ok_or_else(|| RestError::NotFound("no live search results".to_string()))?;
        tracing::info!(
            channel_id,
            video_id = %item.id.video_id,
            title = %item.snippet.title,
            "auto-detected live stream (search)"
        );
        Ok(item.id.video_id)
    }

    /// Fetch one page of live chat messages.
    ///
    /// Non-2xx bodies are still parsed: the caller dispatches on the
    /// embedded error instead of treating every failure as fatal.
    pub async fn live_chat_messages(
        &self,
        live_chat_id: &str,
        page_token: Option<&str>,
    ) -> Result<LiveChatResponse, RestError> {
        let mut query = vec![
            ("liveChatId", live_chat_id),
            ("part", "snippet,authorDetails"),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }
        let resp = self
            .http
            .get(format!("{}/liveChat/messages", self.api_base))
            .query(&query)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;

        let mut parsed: LiveChatResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) if status.is_success() => return Err(e.into()),
            Err(_) => LiveChatResponse::default(),
        };
        if !status.is_success() && parsed.error.is_none() {
            parsed.error = Some(ApiErrorBody {
                code: i64::from(status.as_u16()),
                message: body,
            });
        }
        Ok(parsed)
    }
}

/// Log an API error and report whether the stream has ended (which triggers
/// the stream-end transition upstream).
pub fn handle_api_error(err: &ApiErrorBody) -> bool {
    match err.code {
        401 => {
            tracing::error!(code = err.code, message = %err.message, "authentication failed, check the API key");
        }
        403 => {
            if err.message.contains("quotaExceeded") || err.message.contains("dailyLimitExceeded")
            {
                tracing::error!(
                    message = %err.message,
                    "API quota exceeded; consider raising the poll interval"
                );
            } else if err.message.contains("forbidden")
                || err.message.contains("liveChatDisabled")
            {
                tracing::error!(
                    message = %err.message,
                    "access forbidden; liveChatMessages.list may require OAuth2 instead of an API key"
                );
            } else if err.message.contains("no longer live")
                || err.message.contains("liveChatEnded")
            {
                tracing::warn!(message = %err.message, "live stream has ended");
                return true;
            } else {
                tracing::error!(message = %err.message, "API error (403)");
            }
        }
        404 => {
            tracing::warn!(code = err.code, message = %err.message, "live chat not found, the stream may have ended");
            return true;
        }
        _ => {
            tracing::error!(code = err.code, message = %err.message, "YouTube API error");
        }
    }
    false
}

/// Quota exhaustion check for the monetization sub-poll, which
/// self-terminates instead of ending the stream.
pub fn is_quota_exceeded(err: &ApiErrorBody) -> bool {
    err.code == 403 && (err.message.contains("quota") || err.message.contains("Exceeded"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_conversion_prefers_message_text() {
        let item = LiveChatItem {
            id: "m1".to_string(),
            snippet: Snippet {
                kind: "textMessageEvent".to_string(),
                display_message: "display".to_string(),
                text_message_details: Some(TextMessageDetails {
                    message_text: "raw".to_string(),
                }),
                ..Default::default()
            },
            author_details: AuthorDetails {
                channel_id: "UC1".to_string(),
                display_name: "alice".to_string(),
                ..Default::default()
            },
        };
        let m = item.into_chat_message().unwrap();
        assert_eq!(m.display_text, "raw");
        assert_eq!(m.kind, ChatMessageKind::Text);
        assert_eq!(m.author.name, "alice");
    }

    #[test]
    fn test_item_conversion_skips_unknown_types_and_empty_text() {
        let deleted = LiveChatItem {
            snippet: Snippet {
                kind: "messageDeletedEvent".to_string(),
                display_message: "gone".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(deleted.into_chat_message().is_none());

        let empty = LiveChatItem {
            snippet: Snippet {
                kind: "textMessageEvent".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(empty.into_chat_message().is_none());
    }

    #[test]
    fn test_superchat_conversion_carries_amount() {
        let item = LiveChatItem {
            id: "s1".to_string(),
            snippet: Snippet {
                kind: "superChatEvent".to_string(),
                display_message: "¥500 from bob".to_string(),
                super_chat_details: Some(SuperChatDetails {
                    amount_display_string: "¥500".to_string(),
                    currency: "JPY".to_string(),
                    user_comment: "gg".to_string(),
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let m = item.into_chat_message().unwrap();
        assert_eq!(m.kind, ChatMessageKind::SuperChat);
        let sc = m.super_chat.unwrap();
        assert_eq!(sc.amount_display, "¥500");
        assert_eq!(sc.user_comment, "gg");
    }

    #[test]
    fn test_error_dispatch_stream_end_codes() {
        assert!(handle_api_error(&ApiErrorBody {
            code: 404,
            message: "not found".to_string(),
        }));
        assert!(handle_api_error(&ApiErrorBody {
            code: 403,
            message: "the chat is no longer live".to_string(),
        }));
        assert!(handle_api_error(&ApiErrorBody {
            code: 403,
            message: "liveChatEnded".to_string(),
        }));
        assert!(!handle_api_error(&ApiErrorBody {
            code: 403,
            message: "quotaExceeded".to_string(),
        }));
        assert!(!handle_api_error(&ApiErrorBody {
            code: 401,
            message: "bad key".to_string(),
        }));
        assert!(!handle_api_error(&ApiErrorBody {
            code: 500,
            message: "boom".to_string(),
        }));
    }

    #[test]
    fn test_quota_detection() {
        assert!(is_quota_exceeded(&ApiErrorBody {
            code: 403,
            message: "quotaExceeded".to_string(),
        }));
        assert!(is_quota_exceeded(&ApiErrorBody {
            code: 403,
            message: "Request Exceeded limit".to_string(),
        }));
        assert!(!is_quota_exceeded(&ApiErrorBody {
            code: 404,
            message: "quota".to_string(),
        }));
    }

    #[test]
    fn test_live_chat_response_parses_error_body() {
        let body = r#"{"error":{"code":403,"message":"liveChatEnded"}}"#;
        let parsed: LiveChatResponse = serde_json::from_str(body).unwrap();
        let err = parsed.error.unwrap();
        assert_eq!(err.code, 403);
        assert_eq!(err.message, "liveChatEnded");
    }
}
