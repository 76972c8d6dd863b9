//! Contract tests for the REST transport against a mock YouTube API.
//!
//! The channel's endpoint bases are pointed at a wiremock server, so these
//! exercise the real resolution, polling, paging and stream-end paths over
//! HTTP without touching the network.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stagebridge::bus::MessageBus;
use stagebridge::channels::{Channel, YouTubeChannel};
use stagebridge::config::{ChatSource, FilterConfig, SelectionConfig, YouTubeConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

fn rest_config(server: &MockServer) -> YouTubeConfig {
    YouTubeConfig {
        chat_source: ChatSource::Rest,
        api_key: Some("test-key".to_string()),
        video_id: String::new(),
        channel_id: String::new(),
        live_chat_id: String::new(),
        // Below the public minimum on purpose: tests must not wait 5 s
        // between polls.
        poll_interval_seconds: 1,
        superchat_poll_seconds: 0,
        forward_channel: String::new(),
        forward_chat_id: String::new(),
        message_format: "[YT] {author}: {message}".to_string(),
        allow_from: Vec::new(),
        filter: FilterConfig::default(),
        selection: SelectionConfig::default(),
        batch_comments: false,
        accumulate_comments: false,
        min_accumulate_seconds: 3,
        max_accumulate_seconds: 30,
        api_base: server.uri(),
        feed_base: format!("{}/feeds/videos.xml", server.uri()),
        watch_base: server.uri(),
    }
}

fn chat_item(id: &str, author: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "snippet": {
            "type": "textMessageEvent",
            "liveChatId": "chat-9",
            "authorChannelId": format!("UC-{author}"),
            "publishedAt": "2024-05-01T12:00:00Z",
            "displayMessage": text,
            "textMessageDetails": {"messageText": text}
        },
        "authorDetails": {
            "channelId": format!("UC-{author}"),
            "displayName": author,
            "isChatOwner": false,
            "isChatModerator": false,
            "isChatSponsor": false
        }
    })
}

#[tokio::test]
async fn test_feed_resolution_then_first_poll() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/feeds/videos.xml"))
        .and(query_param("channel_id", "UCtest"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015">
                 <entry><yt:videoId>vid-old</yt:videoId></entry>
                 <entry><yt:videoId>vid-live</yt:videoId></entry>
               </feed>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    // Batch liveness check over the feed candidates (1 quota unit).
    Mock::given(method("GET"))
        .and(path("/videos"))
        .and(query_param("part", "liveStreamingDetails,snippet"))
        .and(query_param("id", "vid-old,vid-live"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [
                {"id": "vid-old", "snippet": {"title": "over"}, "liveStreamingDetails": {}},
                {"id": "vid-live", "snippet": {"title": "on air"},
                 "liveStreamingDetails": {"activeLiveChatId": "chat-9"}}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    // Single-video lookup when the REST transport connects.
    Mock::given(method("GET"))
        .and(path("/videos"))
        .and(query_param("part", "liveStreamingDetails"))
        .and(query_param("id", "vid-live"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [{"liveStreamingDetails": {"activeLiveChatId": "chat-9"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/liveChat/messages"))
        .and(query_param("liveChatId", "chat-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "nextPageToken": "tok1",
            "pollingIntervalMillis": 1000,
            "items": [chat_item("m1", "carol", "hello world")]
        })))
        .mount(&server)
        .await;

    let mut config = rest_config(&server);
    config.channel_id = "UCtest".to_string();

    let bus = Arc::new(MessageBus::new(16));
    let mut inbound = bus.take_inbound().unwrap();
    let channel = YouTubeChannel::new(config, bus).unwrap();

    let root = CancellationToken::new();
    channel.start(&root).await.unwrap();
    assert!(channel.is_running());

    let msg = timeout(TIMEOUT, inbound.recv())
        .await
        .expect("timed out waiting for inbound chat")
        .unwrap();
    assert_eq!(msg.channel, "youtube");
    assert_eq!(msg.content, "[YT] carol: hello world");
    assert_eq!(msg.sender_id, "UC-carol");
    assert_eq!(msg.chat_id, "chat-9");
    assert_eq!(msg.metadata.get("author_name").unwrap(), "carol");
    assert_eq!(msg.metadata.get("message_id").unwrap(), "m1");

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_poll_pages_with_next_page_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/videos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [{"liveStreamingDetails": {"activeLiveChatId": "chat-9"}}]
        })))
        .mount(&server)
        .await;

    // First page: no pageToken. Later pages must carry the cursor.
    Mock::given(method("GET"))
        .and(path("/liveChat/messages"))
        .and(query_param("pageToken", "tok1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "nextPageToken": "tok2",
            "items": [chat_item("m2", "dave", "second page")]
        })))
        .expect(1..)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/liveChat/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "nextPageToken": "tok1",
            "items": [chat_item("m1", "carol", "first page")]
        })))
        .mount(&server)
        .await;

    let mut config = rest_config(&server);
    config.video_id = "vid-live".to_string();

    let bus = Arc::new(MessageBus::new(16));
    let mut inbound = bus.take_inbound().unwrap();
    let channel = YouTubeChannel::new(config, bus).unwrap();

    let root = CancellationToken::new();
    channel.start(&root).await.unwrap();

    let first = timeout(TIMEOUT, inbound.recv()).await.unwrap().unwrap();
    assert_eq!(first.content, "[YT] carol: first page");
    let second = timeout(TIMEOUT, inbound.recv()).await.unwrap().unwrap();
    assert_eq!(second.content, "[YT] dave: second page");

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_stream_end_on_404_stops_polling() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/videos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [{"liveStreamingDetails": {"activeLiveChatId": "chat-dead"}}]
        })))
        .mount(&server)
        .await;

    // 404 from the chat endpoint signals the stream has ended; polling must
    // stop after exactly one request.
    Mock::given(method("GET"))
        .and(path("/liveChat/messages"))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
            "error": {"code": 404, "message": "live chat not found"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = rest_config(&server);
    config.video_id = "vid-dead".to_string();
    // A channel ID is configured, so the stream-end transition hands over
    // to the background reconnect loop instead of giving up.
    config.channel_id = "UCtest".to_string();

    let bus = Arc::new(MessageBus::new(16));
    let channel = YouTubeChannel::new(config, bus).unwrap();

    let root = CancellationToken::new();
    channel.start(&root).await.unwrap();
    assert!(channel.is_running());

    // Wait for the stream-end transition to clear the running flag.
    let stopped = timeout(TIMEOUT, async {
        while channel.is_running() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(stopped.is_ok(), "poll task did not observe stream end");

    // Give a second poll tick the chance to fire if the loop were still
    // alive; the .expect(1) on the mock would then fail on drop.
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    // Stop tears down the reconnect loop and stays idempotent.
    channel.stop().await.unwrap();
    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_transient_http_error_does_not_kill_polling() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/videos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [{"liveStreamingDetails": {"activeLiveChatId": "chat-9"}}]
        })))
        .mount(&server)
        .await;

    // First poll gets a 500 with an unparseable body; the loop must log
    // and keep going rather than treat it as stream end.
    Mock::given(method("GET"))
        .and(path("/liveChat/messages"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/liveChat/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [chat_item("m1", "erin", "recovered")]
        })))
        .mount(&server)
        .await;

    let mut config = rest_config(&server);
    config.video_id = "vid-live".to_string();

    let bus = Arc::new(MessageBus::new(16));
    let mut inbound = bus.take_inbound().unwrap();
    let channel = YouTubeChannel::new(config, bus).unwrap();

    let root = CancellationToken::new();
    channel.start(&root).await.unwrap();

    let msg = timeout(TIMEOUT, inbound.recv()).await.unwrap().unwrap();
    assert_eq!(msg.content, "[YT] erin: recovered");
    assert!(channel.is_running());

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_rest_start_fails_when_video_not_live() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/videos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [{"liveStreamingDetails": {}}]
        })))
        .mount(&server)
        .await;

    let mut config = rest_config(&server);
    config.video_id = "vid-vod".to_string();

    let bus = Arc::new(MessageBus::new(16));
    let channel = YouTubeChannel::new(config, bus).unwrap();

    let root = CancellationToken::new();
    let err = channel.start(&root).await.unwrap_err();
    assert!(err.to_string().contains("not currently live"));
    assert!(!channel.is_running());
}
