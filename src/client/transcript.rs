use crate::chat::{ChatMessage, Role};

/// Greeting shown before the user has said anything
pub const GREETING: &str = "👋 Hi! I'm SAM, your Student Admission Manager. How can I help you today? Feel free to ask about admissions, documents, deadlines, or anything else!";

/// Ordered conversation held by the client
///
/// Append-only, except for the trailing assistant message of the turn in
/// progress, which grows in place as deltas arrive.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
    /// Index of the user message that opened the current turn
    turn_start: Option<usize>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_greeting() -> Self {
        Self {
            messages: vec![ChatMessage::assistant(GREETING)],
            turn_start: None,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a user message and open a new turn
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
        self.turn_start = Some(self.messages.len() - 1);
    }

    /// Grow the assistant message of the current turn, creating it on first delta
    pub fn apply_delta(&mut self, delta: &str) {
        if let Some(last) = self.partial_mut() {
            last.content.push_str(delta);
            return;
        }
        self.messages.push(ChatMessage::assistant(delta));
    }

    /// Assistant text accumulated during the current turn
    pub fn turn_content(&self) -> &str {
        self.partial().map(|m| m.content.as_str()).unwrap_or("")
    }

    /// Remove the current turn's partial assistant message, if any
    pub fn discard_partial(&mut self) {
        if self.partial().is_some() {
            self.messages.pop();
        }
    }

    /// Replace any partial answer with an error bubble
    pub fn fail_turn(&mut self, message: impl Into<String>) {
        self.discard_partial();
        self.messages.push(ChatMessage::error(message));
    }

    /// Last `n` messages worth sending upstream; error bubbles never are
    pub fn context_window(&self, n: usize) -> Vec<ChatMessage> {
        let eligible: Vec<&ChatMessage> = self.messages.iter().filter(|m| !m.error).collect();
        let skip = eligible.len().saturating_sub(n);
        eligible.into_iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.turn_start = None;
    }

    fn partial(&self) -> Option<&ChatMessage> {
        let start = self.turn_start?;
        let last = self.messages.last()?;
        (self.messages.len() - 1 > start && last.role == Role::Assistant && !last.error).then_some(last)
    }

    fn partial_mut(&mut self) -> Option<&mut ChatMessage> {
        self.partial()?;
        self.messages.last_mut()
    }
}
