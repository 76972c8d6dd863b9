//! Public channel video feed (0 API quota).
//!
//! The feed lists a channel's most recent uploads, including in-progress
//! live streams. Combined with a 1-unit `videos.list` batch check this
//! resolves a live video ID without burning search quota.

use serde::Deserialize;
use thiserror::Error;

const MAX_CANDIDATES: usize = 5;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed fetch failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("feed returned status {status}")]
    Status { status: u16 },

    #[error("feed parse failed: {0}")]
    Parse(#[from] quick_xml::DeError),

    #[error("feed empty for channel {0}")]
    Empty(String),
}

#[derive(Debug, Deserialize)]
struct Feed {
    #[serde(rename = "entry", default)]
    entries: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    // The feed namespaces this as yt:videoId; accept both spellings.
    #[serde(rename = "videoId", alias = "yt:videoId", default)]
    video_id: String,
}

/// Fetch the channel feed and return up to five most recent video IDs.
pub async fn recent_video_ids(
    http: &reqwest::Client,
    feed_base: &str,
    channel_id: &str,
) -> Result<Vec<String>, FeedError> {
    let resp = http
        .get(feed_base)
        .query(&[("channel_id", channel_id)])
        .send()
        .await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FeedError::Status {
            status: status.as_u16(),
        });
    }
    let body = resp.text().await?;
    let ids = parse_video_ids(&body)?;
    if ids.is_empty() {
        return Err(FeedError::Empty(channel_id.to_string()));
    }
    Ok(ids)
}

fn parse_video_ids(xml: &str) -> Result<Vec<String>, quick_xml::DeError> {
    let feed: Feed = quick_xml::de::from_str(xml)?;
    Ok(feed
        .entries
        .into_iter()
        .map(|e| e.video_id)
        .filter(|id| !id.is_empty())
        .take(MAX_CANDIDATES)
        .collect())
}
