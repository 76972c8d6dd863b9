//! Comment selection: caps a batch to the per-poll budget.

use rand::seq::SliceRandom;

use crate::config::{SelectionConfig, SelectionStrategy};

use super::message::ChatMessage;

/// Cap `msgs` to `max_comments_per_poll` using the configured strategy.
/// A cap of zero or below disables capping.
pub fn select_comments(cfg: &SelectionConfig, msgs: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let max = cfg.max_comments_per_poll;
    if max <= 0 || msgs.len() <= max as usize {
        return msgs;
    }
    let max = max as usize;

    match cfg.strategy {
        SelectionStrategy::Priority => {
            let mut prioritized = Vec::with_capacity(msgs.len());
            let mut normal = Vec::with_capacity(msgs.len());
            for m in msgs {
                if m.is_priority() {
                    prioritized.push(m);
                } else {
                    normal.push(m);
                }
            }
            prioritized.extend(normal);
            prioritized.truncate(max);
            prioritized
        }
        SelectionStrategy::Random => {
            let mut shuffled = msgs;
            shuffled.shuffle(&mut rand::thread_rng());
            shuffled.truncate(max);
            shuffled
        }
        SelectionStrategy::Latest => {
            let mut msgs = msgs;
            msgs.split_off(msgs.len() - max)
        }
    }
}
