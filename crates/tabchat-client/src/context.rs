use std::collections::VecDeque;
use tabchat_core::{Message, Role};
use tracing::debug;

/// Fixed per-message cost added on top of the content estimate.
pub const MESSAGE_OVERHEAD: usize = 3;

/// Budget used when none is configured.
pub const DEFAULT_MAX_TOKENS: usize = 4096;

/// Appended to [`ContextWindow::context_string`] to explain the role labels
/// to the model.
pub const HISTORY_SUFFIX: &str =
    "以上是历史记录，BOT 代表上文你输出的话， USER 代表用户之前的输入。";

/// Rough token estimation (4 chars ≈ 1 token).
///
/// This is a heuristic, not a tokenizer: it counts Unicode scalar values and
/// rounds up. Eviction decisions depend on it, so swapping in a real
/// tokenizer would change which messages are kept.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    /// Cost frozen at insertion; eviction subtracts exactly this.
    cost: usize,
}

/// Manages the context window for one conversation.
///
/// Messages are kept oldest first together with a running token estimate.
/// Adding never evicts; callers run [`ContextWindow::fit_context`] when they
/// want the budget enforced.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    entries: VecDeque<Entry>,
    current_tokens: usize,
    max_tokens: usize,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOKENS)
    }
}

impl ContextWindow {
    /// An empty window with the given budget.
    pub fn new(max_tokens: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            current_tokens: 0,
            max_tokens,
        }
    }

    /// Appends a copy of `message` and charges its estimated cost.
    pub fn add_message(&mut self, message: &Message) {
        let cost = estimate_tokens(message.content()) + MESSAGE_OVERHEAD;
        self.entries.push_back(Entry {
            message: message.clone(),
            cost,
        });
        self.current_tokens += cost;
    }

    /// Evicts oldest messages until the estimate fits the budget.
    ///
    /// The most recent message is never evicted, so a single message larger
    /// than the whole budget stays in the window on its own.
    pub fn fit_context(&mut self) {
        let mut evicted = 0usize;
        while self.current_tokens > self.max_tokens && self.entries.len() > 1 {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            self.current_tokens -= entry.cost;
            evicted += 1;
        }
        if evicted > 0 {
            debug!(
                evicted,
                remaining = self.entries.len(),
                tokens = self.current_tokens,
                budget = self.max_tokens,
                "Evicted messages from context window"
            );
        }
    }

    /// Changes the budget and immediately enforces it.
    pub fn set_max_tokens(&mut self, max_tokens: usize) {
        self.max_tokens = max_tokens;
        self.fit_context();
    }

    /// Current budget.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Running estimate of the window's cost.
    pub fn current_tokens(&self) -> usize {
        self.current_tokens
    }

    /// Number of messages in the window.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the window holds no messages.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Independent copy of the current messages, oldest first.
    pub fn context(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    /// Flattens the window into `USER:` / `BOT:` lines followed by
    /// [`HISTORY_SUFFIX`]. System messages are left out.
    pub fn context_string(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let label = match entry.message.role {
                Role::User => "USER",
                Role::Assistant => "BOT",
                Role::System => continue,
            };
            out.push_str(label);
            out.push_str(": ");
            out.push_str(entry.message.content());
            out.push_str(" \n");
        }
        out.push_str(HISTORY_SUFFIX);
        out
    }

    /// Drops every message and resets the estimate to zero.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_tokens = 0;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn cost(text: &str) -> usize {
        estimate_tokens(text) + MESSAGE_OVERHEAD
    }

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // Counted per character, not per byte.
        assert_eq!(estimate_tokens("你好世界"), 1);
    }

    #[test]
    fn test_running_total_matches_sum() {
        let mut ctx = ContextWindow::new(10_000);
        let texts = ["hi", "hello there", "", "a much longer message body"];
        for t in texts {
            ctx.add_message(&Message::user(t));
        }
        let expected: usize = texts.iter().map(|t| cost(t)).sum();
        assert_eq!(ctx.current_tokens(), expected);
    }

    #[test]
    fn test_add_does_not_evict() {
        let mut ctx = ContextWindow::new(5);
        ctx.add_message(&Message::user("twelve chars"));
        ctx.add_message(&Message::user("twelve chars"));
        assert_eq!(ctx.len(), 2);
        assert!(ctx.current_tokens() > ctx.max_tokens());
    }

    #[test]
    fn test_fit_evicts_oldest_first() {
        let mut ctx = ContextWindow::new(100);
        let first = Message::user("aaaa");
        let second = Message::assistant("bbbb");
        let third = Message::user("cccc");
        for m in [&first, &second, &third] {
            ctx.add_message(m);
        }
        // Each costs 4; budget of 8 keeps the newest two.
        ctx.set_max_tokens(8);

        let ids: Vec<_> = ctx.context().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![second.id, third.id]);
        assert_eq!(ctx.current_tokens(), 8);
    }

    #[test]
    fn test_oversized_single_message_is_kept() {
        let mut ctx = ContextWindow::new(4);
        ctx.add_message(&Message::user("short"));
        ctx.add_message(&Message::user(&"x".repeat(400)));
        ctx.fit_context();

        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.context()[0].content().len(), 400);
        assert_eq!(ctx.current_tokens(), cost(&"x".repeat(400)));
    }

    #[test]
    fn test_fit_within_budget_for_any_budget() {
        let texts = ["one", "two two", "three three three", "four", "five five"];
        for budget in 0..60 {
            let mut ctx = ContextWindow::new(budget);
            for t in texts {
                ctx.add_message(&Message::user(t));
            }
            ctx.fit_context();
            assert!(ctx.current_tokens() <= budget || ctx.len() <= 1, "budget {budget}");
            assert!(!ctx.is_empty());
        }
    }

    #[test]
    fn test_shrinking_budget_never_grows_context() {
        let texts = ["alpha", "beta beta", "gamma gamma gamma", "delta", "epsilon eps"];
        let mut previous = usize::MAX;
        for budget in (0..80).rev() {
            let mut ctx = ContextWindow::new(10_000);
            for t in texts {
                ctx.add_message(&Message::user(t));
            }
            ctx.set_max_tokens(budget);
            let len = ctx.context().len();
            assert!(len <= previous);
            previous = len;
        }
    }

    #[test]
    fn test_eviction_uses_cost_frozen_at_insertion() {
        let mut ctx = ContextWindow::new(1000);
        let mut streaming = Message::streaming("");
        ctx.add_message(&streaming);
        // The caller's copy keeps growing; the window's estimate does not.
        streaming.append(&"z".repeat(100));
        ctx.add_message(&Message::user("next"));

        ctx.set_max_tokens(0);
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.current_tokens(), cost("next"));
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut ctx = ContextWindow::default();
        ctx.add_message(&Message::user("hi"));

        let mut snapshot = ctx.context();
        snapshot.clear();
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_context_string() {
        let mut ctx = ContextWindow::default();
        ctx.add_message(&Message::user("hi"));
        ctx.add_message(&Message::system("be brief"));
        ctx.add_message(&Message::assistant("hello"));

        assert_eq!(
            ctx.context_string(),
            format!("USER: hi \nBOT: hello \n{HISTORY_SUFFIX}")
        );
    }

    #[test]
    fn test_context_string_empty() {
        assert_eq!(ContextWindow::default().context_string(), HISTORY_SUFFIX);
    }

    #[test]
    fn test_clear_resets_estimate() {
        let mut ctx = ContextWindow::default();
        ctx.add_message(&Message::user("hi"));
        ctx.clear();
        assert!(ctx.is_empty());
        assert_eq!(ctx.current_tokens(), 0);
    }
}
