use chrono::{DateTime, Local};

use crate::chart::{ChartExtraction, ChartSpec};
use crate::error::SendRejection;

pub const STOPPED_MARKER: &str = "*（输出已停止）*";
pub const EMPTY_RESPONSE_MARKER: &str = "*（AI 未返回任何内容）*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    Message,
    /// Synthetic announcement, e.g. a context switch.
    Notice,
    /// Failure report appended after a request errors.
    Diagnostic,
}

#[derive(Debug, Clone)]
pub struct ChatTurn {
    id: TurnId,
    role: Role,
    kind: TurnKind,
    content: String,
    timestamp: DateTime<Local>,
    is_streaming: bool,
    chart: Option<ChartSpec>,
    original_question: Option<String>,
}

impl ChatTurn {
    fn new(id: TurnId, role: Role, kind: TurnKind, content: String) -> Self {
        ChatTurn {
            id,
            role,
            kind,
            content,
            timestamp: Local::now(),
            is_streaming: false,
            chart: None,
            original_question: None,
        }
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn kind(&self) -> TurnKind {
        self.kind
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn has_chart(&self) -> bool {
        self.chart.is_some()
    }

    pub fn chart(&self) -> Option<&ChartSpec> {
        self.chart.as_ref()
    }

    pub fn original_question(&self) -> Option<&str> {
        self.original_question.as_deref()
    }

    pub fn can_regenerate(&self) -> bool {
        self.role == Role::Assistant && !self.is_streaming && self.original_question.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChatState {
    #[default]
    Idle,
    Streaming(TurnId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishKind {
    Completed,
    Stopped,
    Failed,
}

/// Ordered chat history with a single streaming slot.
#[derive(Debug, Default)]
pub struct Conversation {
    turns: Vec<ChatTurn>,
    next_id: u64,
    state: ChatState,
}

impl Conversation {
    pub fn new() -> Self {
        Conversation::default()
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn state(&self) -> ChatState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == ChatState::Idle
    }

    pub fn get(&self, id: TurnId) -> Option<&ChatTurn> {
        self.turns.iter().find(|turn| turn.id == id)
    }

    pub fn last_regenerable(&self) -> Option<&ChatTurn> {
        self.turns.iter().rev().find(|turn| turn.can_regenerate())
    }

    /// Prior conversational turns eligible for request history, oldest first.
    pub fn history(&self, limit: usize) -> Vec<&ChatTurn> {
        let eligible: Vec<&ChatTurn> = self
            .turns
            .iter()
            .filter(|turn| {
                turn.kind == TurnKind::Message
                    && !turn.is_streaming
                    && !turn.content.trim().is_empty()
            })
            .collect();
        let skip = eligible.len().saturating_sub(limit);
        eligible.into_iter().skip(skip).collect()
    }

    /// Appends the user turn and an empty streaming assistant turn.
    pub fn begin_exchange(&mut self, question: &str) -> Result<TurnId, SendRejection> {
        if self.state != ChatState::Idle {
            return Err(SendRejection::Busy);
        }
        if question.trim().is_empty() {
            return Err(SendRejection::Blank);
        }
        let user_id = self.allocate_id();
        self.turns.push(ChatTurn::new(
            user_id,
            Role::User,
            TurnKind::Message,
            question.to_string(),
        ));
        let assistant_id = self.allocate_id();
        let mut assistant = ChatTurn::new(assistant_id, Role::Assistant, TurnKind::Message, String::new());
        assistant.is_streaming = true;
        assistant.original_question = Some(question.to_string());
        self.turns.push(assistant);
        self.state = ChatState::Streaming(assistant_id);
        Ok(assistant_id)
    }

    /// Appends a delta to the streaming turn. Ignored for any other turn.
    pub fn append_delta(&mut self, id: TurnId, delta: &str) -> bool {
        if self.state != ChatState::Streaming(id) || delta.is_empty() {
            return false;
        }
        match self.turn_mut(id) {
            Some(turn) => {
                turn.content.push_str(delta);
                true
            }
            None => false,
        }
    }

    /// Ends streaming for `id`. Returns false when `id` is not the streaming turn.
    pub fn finalize(&mut self, id: TurnId, finish: FinishKind) -> bool {
        if self.state != ChatState::Streaming(id) {
            return false;
        }
        self.state = ChatState::Idle;
        let Some(turn) = self.turn_mut(id) else {
            return false;
        };
        turn.is_streaming = false;
        if turn.content.trim().is_empty() {
            match finish {
                FinishKind::Stopped => turn.content = STOPPED_MARKER.to_string(),
                FinishKind::Completed => turn.content = EMPTY_RESPONSE_MARKER.to_string(),
                FinishKind::Failed => {}
            }
        }
        true
    }

    /// Attaches an extracted chart to a finalized assistant turn.
    pub fn apply_chart(&mut self, id: TurnId, extraction: ChartExtraction) -> bool {
        if self.state == ChatState::Streaming(id) {
            return false;
        }
        match self.turn_mut(id) {
            Some(turn) if turn.role == Role::Assistant => {
                turn.content = extraction.content;
                turn.chart = Some(extraction.spec);
                true
            }
            _ => false,
        }
    }

    pub fn push_notice(&mut self, text: impl Into<String>) -> TurnId {
        self.push_assistant(TurnKind::Notice, text.into())
    }

    pub fn push_diagnostic(&mut self, text: impl Into<String>) -> TurnId {
        self.push_assistant(TurnKind::Diagnostic, text.into())
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.state = ChatState::Idle;
    }

    fn push_assistant(&mut self, kind: TurnKind, content: String) -> TurnId {
        let id = self.allocate_id();
        self.turns
            .push(ChatTurn::new(id, Role::Assistant, kind, content));
        id
    }

    fn allocate_id(&mut self) -> TurnId {
        self.next_id += 1;
        TurnId(self.next_id)
    }

    fn turn_mut(&mut self, id: TurnId) -> Option<&mut ChatTurn> {
        self.turns.iter_mut().find(|turn| turn.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming_count(conversation: &Conversation) -> usize {
        conversation
            .turns()
            .iter()
            .filter(|turn| turn.is_streaming())
            .count()
    }

    #[test]
    fn begin_exchange_appends_user_and_streaming_assistant() {
        let mut conversation = Conversation::new();
        let id = conversation.begin_exchange("今天大盘怎么样？").unwrap();
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.turns()[0].role(), Role::User);
        let assistant = conversation.get(id).unwrap();
        assert!(assistant.is_streaming());
        assert_eq!(assistant.original_question(), Some("今天大盘怎么样？"));
        assert_eq!(conversation.state(), ChatState::Streaming(id));
    }

    #[test]
    fn second_exchange_is_rejected_while_streaming() {
        let mut conversation = Conversation::new();
        let id = conversation.begin_exchange("a").unwrap();
        assert_eq!(conversation.begin_exchange("b"), Err(SendRejection::Busy));
        assert_eq!(conversation.len(), 2);
        conversation.finalize(id, FinishKind::Completed);
        assert!(conversation.begin_exchange("b").is_ok());
    }

    #[test]
    fn blank_question_is_rejected() {
        let mut conversation = Conversation::new();
        assert_eq!(conversation.begin_exchange("  \n"), Err(SendRejection::Blank));
        assert!(conversation.is_empty());
    }

    #[test]
    fn at_most_one_streaming_turn_across_operations() {
        let mut conversation = Conversation::new();
        for round in 0..6 {
            let id = conversation.begin_exchange(&format!("q{round}")).unwrap();
            let _ = conversation.begin_exchange("again");
            assert_eq!(streaming_count(&conversation), 1);
            conversation.append_delta(id, "x");
            let finish = if round % 2 == 0 {
                FinishKind::Completed
            } else {
                FinishKind::Stopped
            };
            conversation.finalize(id, finish);
            assert_eq!(streaming_count(&conversation), 0);
            if round % 3 == 0 {
                conversation.push_diagnostic("err");
            }
        }
    }

    #[test]
    fn deltas_only_reach_the_streaming_turn() {
        let mut conversation = Conversation::new();
        let id = conversation.begin_exchange("q").unwrap();
        assert!(conversation.append_delta(id, "Hel"));
        assert!(conversation.append_delta(id, "lo"));
        conversation.finalize(id, FinishKind::Completed);
        assert!(!conversation.append_delta(id, "!"));
        assert_eq!(conversation.get(id).unwrap().content(), "Hello");
    }

    #[test]
    fn stopped_empty_turn_gets_marker() {
        let mut conversation = Conversation::new();
        let id = conversation.begin_exchange("q").unwrap();
        conversation.finalize(id, FinishKind::Stopped);
        let turn = conversation.get(id).unwrap();
        assert_eq!(turn.content(), STOPPED_MARKER);
        assert!(!turn.is_streaming());
        assert!(conversation.is_idle());
    }

    #[test]
    fn stopped_partial_turn_keeps_content() {
        let mut conversation = Conversation::new();
        let id = conversation.begin_exchange("q").unwrap();
        conversation.append_delta(id, "部分内容");
        conversation.finalize(id, FinishKind::Stopped);
        assert_eq!(conversation.get(id).unwrap().content(), "部分内容");
    }

    #[test]
    fn history_skips_synthetic_turns_and_respects_limit() {
        let mut conversation = Conversation::new();
        for idx in 0..4 {
            let id = conversation.begin_exchange(&format!("q{idx}")).unwrap();
            conversation.append_delta(id, &format!("a{idx}"));
            conversation.finalize(id, FinishKind::Completed);
        }
        conversation.push_diagnostic("boom");
        conversation.push_notice("switched");
        let history = conversation.history(3);
        let contents: Vec<&str> = history.iter().map(|turn| turn.content()).collect();
        assert_eq!(contents, vec!["a2", "q3", "a3"]);
    }

    #[test]
    fn clear_resets_state() {
        let mut conversation = Conversation::new();
        conversation.begin_exchange("q").unwrap();
        conversation.clear();
        assert!(conversation.is_empty());
        assert!(conversation.is_idle());
    }

    #[test]
    fn last_regenerable_points_at_latest_answer() {
        let mut conversation = Conversation::new();
        let first = conversation.begin_exchange("q1").unwrap();
        conversation.finalize(first, FinishKind::Completed);
        let second = conversation.begin_exchange("q2").unwrap();
        assert_eq!(conversation.last_regenerable().unwrap().id(), first);
        conversation.finalize(second, FinishKind::Completed);
        assert_eq!(conversation.last_regenerable().unwrap().id(), second);
    }
}
