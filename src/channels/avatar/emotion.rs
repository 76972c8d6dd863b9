//! Emotion tag parsing for avatar payloads.
//!
//! Agent replies may carry a leading `[emotion] ` tag that drives the
//! avatar's facial expression. Unrecognized tags are left in the text.

/// The emotion vocabulary the avatar renderer understands.
pub const EMOTIONS: [&str; 6] = ["neutral", "happy", "sad", "angry", "relaxed", "surprised"];

/// Extract the emotion tag from reply content.
///
/// `"[happy] text"` parses to `("text", "happy")`. Content without a valid
/// tag is returned unchanged with `default_emotion` (falling back to
/// `neutral` when that is empty).
pub fn parse_emotion(content: &str, default_emotion: &str) -> (String, String) {
    let default = if default_emotion.is_empty() {
        "neutral"
    } else {
        default_emotion
    };

    if content.len() > 2 && content.starts_with('[') {
        if let Some(end) = content.find(']') {
            if end > 1 {
                let tag = content[1..end].to_lowercase();
                if EMOTIONS.contains(&tag.as_str()) {
                    let text = content[end + 1..].trim_start();
                    return (text.to_string(), tag);
                }
            }
        }
    }

    (content.to_string(), default.to_string())
}
