use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chart::extract_chart;
use crate::chat_log::{ChatLogRecord, ChatLogStore};
use crate::command::Command;
use crate::config::AiSettings;
use crate::context::{ContextKey, DataContext};
use crate::conversation::{ChatState, Conversation, FinishKind, TurnId};
use crate::error::{ChatError, SendRejection};
use crate::error_log::ErrorLogStore;
use crate::llm::{LlmClient, LlmRequest};
use crate::prompt::compose_messages;
use crate::render::{ThinkingRenderer, export_html};

/// A validated request whose turns already exist in the conversation.
#[derive(Debug)]
pub struct PendingRequest {
    pub turn_id: TurnId,
    pub request: LlmRequest,
    pub token: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextChange {
    Unchanged,
    /// History cleared; `interrupted` is set when a reply was still streaming.
    Switched { interrupted: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Completed { has_chart: bool },
    Stopped,
    Failed,
}

struct ActiveRequest {
    turn_id: TurnId,
    token: CancellationToken,
}

/// Chat state for one dashboard panel. Only the owner mutates it; request tasks
/// report back through [`Command`] events or run in place via [`ChatSession::drive`].
pub struct ChatSession {
    settings: AiSettings,
    client: Arc<LlmClient>,
    conversation: Conversation,
    renderer: ThinkingRenderer,
    context: DataContext,
    context_key: ContextKey,
    active: Option<ActiveRequest>,
    chat_log: ChatLogStore,
    error_log: ErrorLogStore,
}

impl ChatSession {
    pub fn new(settings: AiSettings, context: DataContext) -> Result<Self, ChatError> {
        let client = Arc::new(LlmClient::new(&settings)?);
        let context_key = context.key();
        Ok(ChatSession {
            settings,
            client,
            conversation: Conversation::new(),
            renderer: ThinkingRenderer::new(),
            context,
            context_key,
            active: None,
            chat_log: ChatLogStore::new(ChatLogStore::default_path()),
            error_log: ErrorLogStore::new(ErrorLogStore::default_path()),
        })
    }

    pub fn with_stores(mut self, chat_log: ChatLogStore, error_log: ErrorLogStore) -> Self {
        self.chat_log = chat_log;
        self.error_log = error_log;
        self
    }

    pub fn settings(&self) -> &AiSettings {
        &self.settings
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn context(&self) -> &DataContext {
        &self.context
    }

    pub fn client(&self) -> Arc<LlmClient> {
        Arc::clone(&self.client)
    }

    pub fn state(&self) -> ChatState {
        self.conversation.state()
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state(), ChatState::Streaming(_))
    }

    /// Configuration problems worth reporting as soon as the chat surface opens.
    pub fn check_ready(&self) -> Result<(), ChatError> {
        self.settings.validate()
    }

    pub fn set_context(&mut self, context: DataContext) -> ContextChange {
        let key = context.key();
        if key == self.context_key {
            self.context = context;
            return ContextChange::Unchanged;
        }
        let interrupted = self.stop();
        self.context = context;
        self.context_key = key;
        self.conversation.clear();
        self.renderer.clear();
        self.conversation.push_notice(format!(
            "已切换到「{}」，之前的对话已清空。可以继续就这份数据提问。",
            self.context.display_name()
        ));
        tracing::info!(context = self.context.display_name(), interrupted, "context switched");
        ContextChange::Switched { interrupted }
    }

    pub fn prepare_send(&mut self, text: &str) -> Result<PendingRequest, SendRejection> {
        if !self.settings.analysis_enabled {
            return Err(SendRejection::Disabled);
        }
        if self.is_streaming() {
            return Err(SendRejection::Busy);
        }
        let question = text.trim();
        if question.is_empty() {
            return Err(SendRejection::Blank);
        }
        if let Err(err) = self.settings.validate() {
            return Err(SendRejection::Misconfigured(err.to_string()));
        }

        let limit = self.settings.history_limit();
        let history = self.conversation.history(limit);
        let messages = compose_messages(&self.context, &history, limit, question);
        let turn_id = self.conversation.begin_exchange(question)?;
        let token = CancellationToken::new();
        self.active = Some(ActiveRequest {
            turn_id,
            token: token.clone(),
        });
        tracing::debug!(?turn_id, history = history_len(&messages), "prepared chat request");
        Ok(PendingRequest {
            turn_id,
            request: LlmRequest::build(&self.settings, messages),
            token,
        })
    }

    /// Re-asks the question behind `turn_id`. Earlier turns stay as they are.
    pub fn prepare_regenerate(&mut self, turn_id: TurnId) -> Result<PendingRequest, SendRejection> {
        let question = self
            .conversation
            .get(turn_id)
            .filter(|turn| turn.can_regenerate())
            .and_then(|turn| turn.original_question())
            .map(str::to_string)
            .ok_or(SendRejection::NothingToRegenerate)?;
        self.prepare_send(&question)
    }

    pub fn apply_delta(&mut self, turn_id: TurnId, delta: &str) -> bool {
        self.conversation.append_delta(turn_id, delta)
    }

    /// Finalises `turn_id`. Results for turns that are no longer streaming
    /// (stopped, or cleared by a context switch) are dropped.
    pub fn complete(
        &mut self,
        turn_id: TurnId,
        result: Result<(), ChatError>,
    ) -> Option<RequestOutcome> {
        if self.active.as_ref().map(|active| active.turn_id) == Some(turn_id) {
            self.active = None;
        }
        match result {
            Ok(()) => {
                if !self.conversation.finalize(turn_id, FinishKind::Completed) {
                    return None;
                }
                let has_chart = self.attach_chart(turn_id);
                self.record_exchange(turn_id);
                Some(RequestOutcome::Completed { has_chart })
            }
            Err(err) if err.is_cancelled() => self
                .conversation
                .finalize(turn_id, FinishKind::Stopped)
                .then_some(RequestOutcome::Stopped),
            Err(err) => {
                if !self.conversation.finalize(turn_id, FinishKind::Failed) {
                    return None;
                }
                tracing::warn!(kind = err.kind_label(), status = ?err.status(), %err, "chat request failed");
                self.conversation.push_diagnostic(err.diagnostic_message());
                if let Err(log_err) = self.error_log.append_error(&err) {
                    tracing::warn!(%log_err, "failed to write error log");
                }
                Some(RequestOutcome::Failed)
            }
        }
    }

    /// Cancels the in-flight request and finalises its turn right away.
    pub fn stop(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        active.token.cancel();
        self.conversation.finalize(active.turn_id, FinishKind::Stopped)
    }

    pub async fn send(&mut self, text: &str) -> Result<TurnId, SendRejection> {
        self.send_with(text, &mut |_: &str| {}).await
    }

    /// Sends in place, passing each applied delta to `observer`.
    pub async fn send_with(
        &mut self,
        text: &str,
        observer: &mut (dyn FnMut(&str) + Send),
    ) -> Result<TurnId, SendRejection> {
        let pending = self.prepare_send(text)?;
        let turn_id = pending.turn_id;
        self.drive(pending, observer).await;
        Ok(turn_id)
    }

    pub async fn drive(
        &mut self,
        pending: PendingRequest,
        observer: &mut (dyn FnMut(&str) + Send),
    ) -> Option<RequestOutcome> {
        let PendingRequest {
            turn_id,
            request,
            token,
        } = pending;
        let client = Arc::clone(&self.client);
        let conversation = &mut self.conversation;
        let result = client
            .execute(&request, &token, &mut |delta: &str| {
                if conversation.append_delta(turn_id, delta) {
                    observer(delta);
                }
            })
            .await;
        self.complete(turn_id, result)
    }

    pub fn export_html(&mut self, path: &Path) -> anyhow::Result<()> {
        let title = format!("{} · AI 对话", self.context.display_name());
        let page = export_html(&self.conversation, &mut self.renderer, &title);
        fs::write(path, page).with_context(|| format!("无法写入 {}", path.display()))?;
        tracing::info!(path = %path.display(), turns = self.conversation.len(), "conversation exported");
        Ok(())
    }

    fn attach_chart(&mut self, turn_id: TurnId) -> bool {
        let Some(extraction) = self
            .conversation
            .get(turn_id)
            .and_then(|turn| extract_chart(turn.content()))
        else {
            return false;
        };
        tracing::debug!(chart = %extraction.spec.brief(), "chart extracted");
        self.conversation.apply_chart(turn_id, extraction)
    }

    fn record_exchange(&self, turn_id: TurnId) {
        let Some(turn) = self.conversation.get(turn_id) else {
            return;
        };
        let record = ChatLogRecord::new(
            self.context.display_name(),
            turn.original_question().unwrap_or_default(),
            turn.content(),
            turn.has_chart(),
        );
        if let Err(err) = self.chat_log.append(&record) {
            tracing::warn!(%err, "failed to write chat log");
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.token.cancel();
        }
    }
}

/// Runs `pending` on a background task, reporting deltas and the final result
/// as [`Command`] events.
pub fn spawn_request(
    client: Arc<LlmClient>,
    pending: PendingRequest,
    tx: UnboundedSender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let PendingRequest {
            turn_id,
            request,
            token,
        } = pending;
        let result = client
            .execute(&request, &token, &mut |delta: &str| {
                let _ = tx.send(Command::Delta(turn_id, delta.to_string()));
            })
            .await;
        let _ = tx.send(Command::Finished(turn_id, result));
    })
}

fn history_len(messages: &[crate::prompt::PromptMessage]) -> usize {
    messages.len().saturating_sub(2)
}
