use crate::context::ContextWindow;
use crate::stream::StreamEvent;
use chrono::{DateTime, Utc};
use tabchat_core::Message;
use tracing::warn;
use uuid::Uuid;

/// One conversation: the rendered message list plus the context window
/// that decides what is sent to the model.
#[derive(Debug, Clone)]
pub struct ConversationTab {
    /// Unique tab identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Whether this is the focused tab.
    pub is_active: bool,
    /// Incognito tabs are never meant to be persisted by the host.
    pub is_private: bool,
    /// When the tab was opened.
    pub created_at: DateTime<Utc>,
    /// Last change to the tab or its messages.
    pub updated_at: DateTime<Utc>,
    messages: Vec<Message>,
    context: ContextWindow,
}

impl ConversationTab {
    /// An empty, inactive tab with the default context budget.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            is_active: false,
            is_private: false,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            context: ContextWindow::default(),
        }
    }

    /// Uses a context window with the given budget.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.context.set_max_tokens(max_tokens);
        self
    }

    /// Changes the display name.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.touch();
    }

    /// Marks the tab as the focused one (or not).
    pub fn set_active(&mut self, active: bool) {
        self.is_active = active;
        self.touch();
    }

    /// Rendered messages, in display order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The window of messages sent to the model.
    pub fn context(&self) -> &ContextWindow {
        &self.context
    }

    /// Mutable access, e.g. to change the budget.
    pub fn context_mut(&mut self) -> &mut ContextWindow {
        &mut self.context
    }

    /// Shows a finished message and records it in the context window.
    pub fn push_message(&mut self, message: Message) {
        self.record(&message);
        self.messages.push(message);
        self.touch();
    }

    /// Renders one stream event.
    ///
    /// `Started` adds the streaming message, `Appended` grows it, and
    /// `Completed` or `Aborted` finalize it with the given content and record
    /// it in the context window. A stream that fails or completes without a
    /// `Started` event leaves the message list as it was unless there is
    /// content to show.
    pub fn apply_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Started { message } => {
                self.messages.push(message.clone());
            }
            StreamEvent::Appended { message_id, delta } => match self.find_mut(*message_id) {
                Some(message) => {
                    message.append(delta);
                }
                None => warn!(message_id = %message_id, "Delta for unknown message"),
            },
            StreamEvent::Completed {
                message_id,
                content,
            }
            | StreamEvent::Aborted {
                message_id,
                content,
            } => self.finalize(*message_id, content),
            StreamEvent::Failed { message_id, error } => {
                warn!(message_id = %message_id, error = %error, "Stream failed");
                if let Some(message) = self.find_mut(*message_id) {
                    message.finish();
                }
            }
        }
        self.touch();
    }

    /// Empties both the message list and the context window.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.context.clear();
        self.touch();
    }

    fn finalize(&mut self, message_id: Uuid, content: &str) {
        let finished = match self.find_mut(message_id) {
            Some(message) => {
                // Catch up on anything the rendered copy missed.
                if let Some(rest) = content.strip_prefix(message.content()) {
                    message.append(rest);
                }
                message.finish();
                message.clone()
            }
            None if content.is_empty() => return,
            None => {
                let mut message = Message::streaming(content);
                message.id = message_id;
                message.finish();
                self.messages.push(message.clone());
                message
            }
        };
        self.record(&finished);
    }

    fn record(&mut self, message: &Message) {
        self.context.add_message(message);
        self.context.fit_context();
    }

    fn find_mut(&mut self, id: Uuid) -> Option<&mut Message> {
        self.messages.iter_mut().rev().find(|m| m.id == id)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::stream::StreamDecoder;

    fn events_for(body: &str) -> Vec<StreamEvent> {
        let mut decoder = StreamDecoder::new();
        let mut events = decoder.feed(body.as_bytes()).unwrap();
        events.extend(decoder.finish().unwrap().0);
        events
    }

    #[test]
    fn test_push_message_records_into_context() {
        let mut tab = ConversationTab::new("Chat");
        tab.push_message(Message::user("hi"));
        assert_eq!(tab.messages().len(), 1);
        assert_eq!(tab.context().len(), 1);
    }

    #[test]
    fn test_stream_events_render_and_record() {
        let mut tab = ConversationTab::new("Chat");
        tab.push_message(Message::user("hi"));

        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\
                    data: [DONE]\n";
        let events = events_for(body);

        tab.apply_event(&events[0]);
        assert!(tab.messages()[1].is_streaming());
        // Context only records the assistant message once it completes.
        assert_eq!(tab.context().len(), 1);

        for event in &events[1..] {
            tab.apply_event(event);
        }
        let reply = &tab.messages()[1];
        assert_eq!(reply.content(), "Hello");
        assert!(!reply.is_streaming());

        let context = tab.context().context();
        assert_eq!(context.len(), 2);
        assert_eq!(context[1].content(), "Hello");
    }

    #[test]
    fn test_empty_completion_adds_nothing() {
        let mut tab = ConversationTab::new("Chat");
        for event in events_for("") {
            tab.apply_event(&event);
        }
        assert!(tab.messages().is_empty());
        assert!(tab.context().is_empty());
    }

    #[test]
    fn test_set_active_advances_updated_at() {
        let mut tab = ConversationTab::new("Chat");
        let before = tab.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));

        tab.set_active(true);
        assert!(tab.is_active);
        assert!(tab.updated_at > before);

        let activated = tab.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        tab.set_active(false);
        assert!(!tab.is_active);
        assert!(tab.updated_at > activated);
    }

    #[test]
    fn test_clear_empties_both() {
        let mut tab = ConversationTab::new("Chat").with_max_tokens(100);
        tab.push_message(Message::user("one"));
        tab.push_message(Message::assistant("two"));
        let before = tab.updated_at;

        tab.clear();
        assert!(tab.messages().is_empty());
        assert!(tab.context().is_empty());
        assert_eq!(tab.context().current_tokens(), 0);
        assert!(tab.updated_at >= before);
    }

    #[test]
    fn test_context_budget_applies_but_display_keeps_everything() {
        let mut tab = ConversationTab::new("Chat").with_max_tokens(10);
        for i in 0..5 {
            tab.push_message(Message::user(format!("message number {i}")));
        }
        assert_eq!(tab.messages().len(), 5);
        assert!(tab.context().len() < 5);
        assert!(tab.context().current_tokens() <= 10 || tab.context().len() == 1);
    }
}
