//! Per-poll quality filter.
//!
//! Drops low-value chat before it reaches the agent: NG words, too-short
//! messages, URLs, and single-character spam. All length and frequency
//! checks count characters, not bytes; CJK chat is the common case here.

use crate::config::FilterConfig;

use super::message::ChatMessage;

/// Apply the configured quality rules to one poll's worth of messages.
///
/// With every rule unconfigured this is the identity and the input is
/// returned untouched.
pub fn pre_filter(cfg: &FilterConfig, items: Vec<ChatMessage>) -> Vec<ChatMessage> {
    if cfg.is_noop() {
        return items;
    }
    items
        .into_iter()
        .filter(|m| !m.display_text.is_empty() && !should_filter(cfg, &m.display_text))
        .collect()
}

fn should_filter(cfg: &FilterConfig, text: &str) -> bool {
    let lower = text.to_lowercase();
    for ng in &cfg.ng_words {
        if lower.contains(&ng.to_lowercase()) {
            return true;
        }
    }

    if cfg.min_message_length > 0 && text.chars().count() < cfg.min_message_length {
        return true;
    }

    if cfg.block_urls && (text.contains("http://") || text.contains("https://")) {
        return true;
    }

    if cfg.max_repeat_ratio > 0.0 {
        let total = text.chars().count();
        if total > 0 {
            let mut freq = std::collections::HashMap::new();
            for c in text.chars() {
                *freq.entry(c).or_insert(0usize) += 1;
            }
            let max_count = freq.values().copied().max().unwrap_or(0);
            if max_count as f64 / total as f64 > cfg.max_repeat_ratio {
                return true;
            }
        }
    }

    false
}
