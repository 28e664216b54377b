use crate::fragment::{ChatFragment, FinishReason};

/// Session-scoped identifier for one accumulated message.
///
/// Distinct from the server-side fragment `id`; the session allocates these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    System,
    User,
    #[default]
    Assistant,
}

impl Role {
    fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Read-only snapshot of one assistant turn under accumulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    /// Every `content` delta seen so far, concatenated in arrival order.
    pub text: String,
    pub is_complete: bool,
    /// Terminal reason, once one arrived. `error` still keeps the text; the
    /// distinction is informational for the caller.
    pub finish_reason: Option<FinishReason>,
}

impl Message {
    fn pending(id: MessageId) -> Self {
        Self {
            id,
            role: Role::default(),
            text: String::new(),
            is_complete: false,
            finish_reason: None,
        }
    }
}

/// Folds the response fragments of one turn into a single growing message.
///
/// Fragments arrive in send order on one connection; the accumulator never
/// reorders or buffers them.
#[derive(Debug)]
pub struct MessageAccumulator {
    message: Message,
    role_assigned: bool,
}

impl MessageAccumulator {
    /// Starts a turn with an empty pending message, so callers can show a
    /// placeholder before the first fragment arrives.
    pub fn new(id: MessageId) -> Self {
        Self {
            message: Message::pending(id),
            role_assigned: false,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn is_complete(&self) -> bool {
        self.message.is_complete
    }

    /// Applies one fragment and returns the updated snapshot. Never fails.
    ///
    /// Content appends verbatim with no separator, the first carried role
    /// wins, and a terminal `finish_reason` freezes the message. Content
    /// riding on the terminal fragment lands before the freeze. A frozen
    /// message ignores every further fragment, including any the server sends
    /// after its terminal one.
    pub fn apply(&mut self, fragment: &ChatFragment) -> &Message {
        if self.message.is_complete {
            tracing::debug!(
                message_id = self.message.id.0,
                fragment_id = %fragment.id,
                "dropping fragment for an already-complete message"
            );
            return &self.message;
        }

        if let Some(content) = &fragment.content {
            self.message.text.push_str(content);
        }

        if !self.role_assigned
            && let Some(role) = fragment.role.as_deref().and_then(Role::from_wire)
        {
            self.message.role = role;
            self.role_assigned = true;
        }

        if let Some(reason) = fragment.finish_reason
            && reason.is_terminal()
        {
            self.message.finish_reason = Some(reason);
            self.message.is_complete = true;
        }

        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(content: Option<&str>) -> ChatFragment {
        ChatFragment {
            id: "m1".to_string(),
            model: "llama-3-8b".to_string(),
            created: 1_718_600_000,
            index: 0,
            role: None,
            content: content.map(str::to_string),
            finish_reason: None,
        }
    }

    fn terminal(content: Option<&str>, reason: FinishReason) -> ChatFragment {
        ChatFragment {
            finish_reason: Some(reason),
            ..fragment(content)
        }
    }

    #[test]
    fn starts_empty_and_incomplete() {
        let accumulator = MessageAccumulator::new(MessageId::new(7));
        let message = accumulator.message();
        assert_eq!(message.id, MessageId::new(7));
        assert_eq!(message.text, "");
        assert_eq!(message.role, Role::Assistant);
        assert!(!message.is_complete);
    }

    #[test]
    fn concatenates_content_in_arrival_order_without_separators() {
        let mut accumulator = MessageAccumulator::new(MessageId::new(1));
        for delta in ["Boo", "lean", " alge", "bra"] {
            accumulator.apply(&fragment(Some(delta)));
        }
        assert_eq!(accumulator.message().text, "Boolean algebra");
    }

    #[test]
    fn absent_content_appends_nothing() {
        let mut accumulator = MessageAccumulator::new(MessageId::new(1));
        accumulator.apply(&fragment(Some("Hel")));
        accumulator.apply(&fragment(None));
        accumulator.apply(&fragment(Some("lo")));
        assert_eq!(accumulator.message().text, "Hello");
    }

    #[test]
    fn first_carried_role_wins() {
        let mut accumulator = MessageAccumulator::new(MessageId::new(1));

        let mut first = fragment(Some("a"));
        first.role = Some("system".to_string());
        accumulator.apply(&first);

        let mut second = fragment(Some("b"));
        second.role = Some("user".to_string());
        accumulator.apply(&second);

        assert_eq!(accumulator.message().role, Role::System);
    }

    #[test]
    fn stop_completes_the_message() {
        let mut accumulator = MessageAccumulator::new(MessageId::new(1));
        accumulator.apply(&fragment(Some("Hel")));
        accumulator.apply(&fragment(Some("lo")));
        let message = accumulator.apply(&terminal(Some(""), FinishReason::Stop));

        assert!(message.is_complete);
        assert_eq!(message.text, "Hello");
        assert_eq!(message.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn content_on_the_terminal_fragment_lands_before_the_freeze() {
        let mut accumulator = MessageAccumulator::new(MessageId::new(1));
        accumulator.apply(&fragment(Some("partial ")));
        let message = accumulator.apply(&terminal(Some("end"), FinishReason::Error));

        assert!(message.is_complete);
        assert_eq!(message.text, "partial end");
        assert_eq!(message.finish_reason, Some(FinishReason::Error));
    }

    #[test]
    fn server_error_preserves_accumulated_text() {
        let mut accumulator = MessageAccumulator::new(MessageId::new(1));
        accumulator.apply(&fragment(Some("kept")));
        accumulator.apply(&terminal(None, FinishReason::Error));
        assert_eq!(accumulator.message().text, "kept");
    }

    #[test]
    fn frozen_messages_ignore_further_fragments() {
        let mut accumulator = MessageAccumulator::new(MessageId::new(1));
        accumulator.apply(&fragment(Some("done")));
        accumulator.apply(&terminal(None, FinishReason::Stop));

        let mut late = fragment(Some(" extra"));
        late.role = Some("user".to_string());
        let message = accumulator.apply(&late).clone();

        assert_eq!(message.text, "done");
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn non_terminal_finish_reasons_do_not_complete() {
        let mut accumulator = MessageAccumulator::new(MessageId::new(1));
        accumulator.apply(&terminal(Some("cut"), FinishReason::Length));
        assert!(!accumulator.is_complete());
        assert_eq!(accumulator.message().text, "cut");
        assert_eq!(accumulator.message().finish_reason, None);
    }
}
