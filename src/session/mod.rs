use crate::history::HistoryStore;
use crate::message_tracing::MessageTracer;
use crate::models::{ChatMessage, ChatRequest, ChatSession, ProviderDescriptor};
use crate::providers::error::ProviderError;
use crate::providers::ChatProvider;
use crate::quota::QuotaTracker;
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("A response is already in progress")]
    Busy,
}

/// Where the controller is in the send cycle.
///
/// `Idle -> Sending -> Streaming -> Idle`, with `Cancelled` entered from
/// `cancel_response` and `Error` when the turn failed. A new send is
/// accepted from every phase except `Sending` and `Streaming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Sending,
    Streaming,
    Cancelled,
    Error,
}

impl SessionPhase {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SessionPhase::Sending | SessionPhase::Streaming)
    }
}

struct ControllerState {
    session: ChatSession,
    phase: SessionPhase,
    staged_images: Vec<String>,
    model_version: String,
    cancel: Option<CancellationToken>,
    /// Bumped on every send; a finishing turn only touches the phase if it is still current
    generation: u64,
}

/// Everything one turn needs once the state lock is released
struct Turn {
    request: ChatRequest,
    message_id: Uuid,
    cancel: CancellationToken,
    generation: u64,
}

enum TurnOutcome {
    Completed,
    Cancelled,
    Failed(ProviderError),
}

/// Drives one conversation against one provider.
///
/// Message text is only ever appended, in arrival order, to the message
/// that started the turn. Observers get a fresh snapshot of the message
/// list after every change through [`subscribe`](Self::subscribe).
/// Clones share the same conversation.
#[derive(Clone)]
pub struct ChatSessionController {
    provider: Arc<dyn ChatProvider>,
    history: HistoryStore,
    quota: Option<QuotaTracker>,
    tracer: Arc<MessageTracer>,
    state: Arc<Mutex<ControllerState>>,
    messages_tx: Arc<watch::Sender<Vec<ChatMessage>>>,
}

impl ChatSessionController {
    /// Start a new, empty conversation
    pub fn new(provider: Arc<dyn ChatProvider>, history: HistoryStore) -> Self {
        let session = ChatSession::new(provider.descriptor().id, Vec::new());
        Self::resume(provider, session, history)
    }

    /// Continue a stored conversation
    pub fn resume(provider: Arc<dyn ChatProvider>, session: ChatSession, history: HistoryStore) -> Self {
        if session.api_model_type != provider.descriptor().id {
            tracing::warn!(
                "Resuming {} session {} with provider {}",
                session.api_model_type,
                session.id,
                provider.descriptor().id
            );
        }

        let (messages_tx, _) = watch::channel(session.messages.clone());
        Self {
            provider,
            history,
            quota: None,
            tracer: Arc::new(MessageTracer::disabled()),
            state: Arc::new(Mutex::new(ControllerState {
                session,
                phase: SessionPhase::Idle,
                staged_images: Vec::new(),
                model_version: String::new(),
                cancel: None,
                generation: 0,
            })),
            messages_tx: Arc::new(messages_tx),
        }
    }

    /// Decrement this quota after every successful turn
    pub fn with_quota(mut self, quota: QuotaTracker) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<MessageTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn descriptor(&self) -> &ProviderDescriptor {
        self.provider.descriptor()
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock().phase
    }

    pub fn session(&self) -> ChatSession {
        self.lock().session.clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.lock().session.messages.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.messages_tx.subscribe()
    }

    /// Attach a base64 JPEG to the next message
    pub fn stage_image(&self, image_b64: impl Into<String>) {
        self.lock().staged_images.push(image_b64.into());
    }

    pub fn staged_images(&self) -> Vec<String> {
        self.lock().staged_images.clone()
    }

    /// Accepts a display name or wire id; empty restores the provider default
    pub fn set_model_version(&self, model: &str) {
        let resolved = self.provider.descriptor().resolve_model(model).to_string();
        self.lock().model_version = resolved;
    }

    pub fn model_version(&self) -> String {
        let state = self.lock();
        if state.model_version.is_empty() {
            self.provider.descriptor().default_model().to_string()
        } else {
            state.model_version.clone()
        }
    }

    /// Send `input` and stream the reply into a new message.
    ///
    /// Returns once the turn has finished and the session is saved to
    /// history. Provider failures end up on the message itself, not in
    /// the return value. Empty input is not rejected here.
    pub async fn send_message(&self, input: impl Into<String>) -> Result<(), SessionError> {
        let turn = self.begin_turn(input.into())?;
        let trace_id = self.tracer.new_trace_id();
        self.tracer
            .trace_request(&trace_id, self.provider.descriptor().id, &turn.request);

        let started = Instant::now();
        let outcome = self.run_turn(&turn).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        self.finish_turn(&turn, outcome, &trace_id, latency_ms).await;
        Ok(())
    }

    /// Stop the in-flight response, keeping whatever text has arrived.
    /// Safe to call when nothing is in flight.
    pub fn cancel_response(&self) {
        let mut state = self.lock();
        let Some(cancel) = state.cancel.take() else {
            return;
        };
        cancel.cancel();
        if state.phase.is_in_flight() {
            state.phase = SessionPhase::Cancelled;
        }
        tracing::debug!("Cancelled response in session {}", state.session.id);
    }

    /// Plain-text transcript for sharing
    pub fn share_text(&self) -> String {
        self.lock()
            .session
            .messages
            .iter()
            .map(|m| {
                let response = m
                    .response_text
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .unwrap_or("No response");
                format!("User: {}\nAI: {}\n\n", m.send_text, response)
            })
            .collect()
    }

    fn begin_turn(&self, input: String) -> Result<Turn, SessionError> {
        let mut state = self.lock();
        if state.phase.is_in_flight() {
            return Err(SessionError::Busy);
        }

        let descriptor = self.provider.descriptor();
        let images = std::mem::take(&mut state.staged_images);
        let request = ChatRequest {
            message: input.clone(),
            history: state.session.messages.clone(),
            images: images.clone(),
            model_version: state.model_version.clone(),
        };

        let message = ChatMessage::new(input, descriptor.icon, images);
        let message_id = message.id;
        state.session.messages.push(message);

        let cancel = CancellationToken::new();
        state.cancel = Some(cancel.clone());
        state.generation += 1;
        state.phase = SessionPhase::Sending;
        self.messages_tx.send_replace(state.session.messages.clone());

        Ok(Turn {
            request,
            message_id,
            cancel,
            generation: state.generation,
        })
    }

    async fn run_turn(&self, turn: &Turn) -> TurnOutcome {
        let mut stream = match self
            .provider
            .stream_chat(turn.request.clone(), turn.cancel.clone())
            .await
        {
            Ok(stream) => stream,
            Err(e) => return self.classify(turn, e),
        };

        self.set_phase_if_current(turn.generation, SessionPhase::Sending, SessionPhase::Streaming);

        while let Some(item) = stream.next().await {
            match item {
                Ok(delta) => {
                    if !self.apply_delta(turn, &delta) {
                        return TurnOutcome::Cancelled;
                    }
                }
                Err(e) => return self.classify(turn, e),
            }
        }

        if turn.cancel.is_cancelled() {
            TurnOutcome::Cancelled
        } else {
            TurnOutcome::Completed
        }
    }

    fn classify(&self, turn: &Turn, error: ProviderError) -> TurnOutcome {
        if error.is_cancellation() || turn.cancel.is_cancelled() {
            TurnOutcome::Cancelled
        } else {
            TurnOutcome::Failed(error)
        }
    }

    /// Append a delta unless the turn was cancelled. The token is checked
    /// under the state lock, which `cancel_response` also holds while firing
    /// it, so no delta lands after a cancel.
    fn apply_delta(&self, turn: &Turn, delta: &str) -> bool {
        let mut state = self.lock();
        if turn.cancel.is_cancelled() {
            return false;
        }
        let Some(message) = state.session.messages.iter_mut().find(|m| m.id == turn.message_id) else {
            return true;
        };
        message.append_response(delta);
        self.messages_tx.send_replace(state.session.messages.clone());
        true
    }

    fn set_phase_if_current(&self, generation: u64, from: SessionPhase, to: SessionPhase) {
        let mut state = self.lock();
        if state.generation == generation && state.phase == from {
            state.phase = to;
        }
    }

    async fn finish_turn(&self, turn: &Turn, outcome: TurnOutcome, trace_id: &str, latency_ms: u64) {
        let session = {
            let mut state = self.lock();
            let is_current = state.generation == turn.generation;
            let message = state
                .session
                .messages
                .iter_mut()
                .find(|m| m.id == turn.message_id);

            match &outcome {
                TurnOutcome::Completed => {
                    let text = message.map(|m| m.response_or_empty().to_string()).unwrap_or_default();
                    self.tracer.trace_response(trace_id, &text, latency_ms, false);
                }
                TurnOutcome::Cancelled => {
                    let text = message.map(|m| m.response_or_empty().to_string()).unwrap_or_default();
                    self.tracer.trace_response(trace_id, &text, latency_ms, true);
                }
                TurnOutcome::Failed(e) => {
                    tracing::error!("Chat with {} failed: {}", self.provider.descriptor().id, e);
                    if let Some(message) = message {
                        message.response_error = Some(e.user_message());
                    }
                    self.tracer.trace_error(trace_id, &e.to_string(), latency_ms);
                }
            }

            if is_current {
                state.cancel = None;
                state.phase = match outcome {
                    TurnOutcome::Failed(_) => SessionPhase::Error,
                    _ => SessionPhase::Idle,
                };
            }
            self.messages_tx.send_replace(state.session.messages.clone());
            state.session.clone()
        };

        if matches!(outcome, TurnOutcome::Completed) {
            if let Some(ref quota) = self.quota {
                quota.decrement();
            }
        }

        self.history.upsert(session).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModelOption, ProviderId};
    use crate::providers::TextStream;
    use async_trait::async_trait;
    use futures::stream;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Clone, Copy)]
    enum Ending {
        Done,
        Fail,
        FailUpFront,
        WaitForCancel,
    }

    struct ScriptedProvider {
        descriptor: ProviderDescriptor,
        deltas: Vec<&'static str>,
        ending: Ending,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn new(deltas: Vec<&'static str>, ending: Ending) -> Arc<Self> {
            Arc::new(Self {
                descriptor: ProviderDescriptor {
                    id: ProviderId::ChatGpt,
                    title: "ChatGPT",
                    description: "scripted",
                    icon: "chatgpt",
                    models: vec![ModelOption { name: "GPT-4o Mini", id: "gpt-4o-mini" }],
                    system_prompt: None,
                },
                deltas,
                ending,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn descriptor(&self) -> &ProviderDescriptor {
            &self.descriptor
        }

        async fn stream_chat(
            &self,
            request: ChatRequest,
            cancel: CancellationToken,
        ) -> Result<TextStream, ProviderError> {
            self.seen.lock().unwrap().push(request);

            let head = stream::iter(
                self.deltas
                    .iter()
                    .map(|d| Ok::<_, ProviderError>(d.to_string()))
                    .collect::<Vec<_>>(),
            );
            let tail: TextStream = match self.ending {
                Ending::Done => Box::pin(stream::empty()),
                Ending::Fail => Box::pin(stream::once(async {
                    Err::<String, _>(ProviderError::UnexpectedStatus {
                        status: 502,
                        message: "bad gateway".into(),
                    })
                })),
                Ending::FailUpFront => {
                    return Err(ProviderError::UnexpectedStatus {
                        status: 500,
                        message: "boom".into(),
                    })
                }
                Ending::WaitForCancel => Box::pin(stream::once(async move {
                    cancel.cancelled().await;
                    Err::<String, _>(ProviderError::Cancelled)
                })),
            };
            Ok(Box::pin(head.chain(tail)))
        }
    }

    fn controller(provider: Arc<ScriptedProvider>, dir: &TempDir) -> ChatSessionController {
        ChatSessionController::new(provider, HistoryStore::in_dir(dir.path()))
    }

    #[tokio::test]
    async fn test_deltas_accumulate_in_order() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec!["Hi", " there", "!"], Ending::Done);
        let controller = controller(provider, &dir);

        controller.send_message("Hello").await.unwrap();

        let messages = controller.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].response_text.as_deref(), Some("Hi there!"));
        assert!(messages[0].response_error.is_none());
        assert_eq!(controller.phase(), SessionPhase::Idle);
        assert_eq!(controller.subscribe().borrow()[0].response_text.as_deref(), Some("Hi there!"));
    }

    #[tokio::test]
    async fn test_history_and_images_feed_the_request() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec!["ok"], Ending::Done);
        let controller = controller(provider.clone(), &dir);

        controller.send_message("first").await.unwrap();
        controller.stage_image("aW1n");
        controller.set_model_version("GPT-4o Mini");
        controller.send_message("second").await.unwrap();

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].history.len(), 0);
        assert!(seen[0].model_version.is_empty());
        assert_eq!(seen[1].history.len(), 1);
        assert_eq!(seen[1].history[0].send_text, "first");
        assert_eq!(seen[1].images, vec!["aW1n".to_string()]);
        assert_eq!(seen[1].model_version, "gpt-4o-mini");
        assert!(controller.staged_images().is_empty());
        assert_eq!(controller.messages()[1].images.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_text_without_error() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec!["a", "b"], Ending::WaitForCancel);
        let controller = controller(provider, &dir);
        let mut rx = controller.subscribe();

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.send_message("Hello").await })
        };

        rx.wait_for(|msgs| msgs.last().and_then(|m| m.response_text.as_deref()) == Some("ab"))
            .await
            .unwrap();
        controller.cancel_response();
        assert_eq!(controller.phase(), SessionPhase::Cancelled);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let message = &controller.messages()[0];
        assert_eq!(message.response_text.as_deref(), Some("ab"));
        assert!(message.response_error.is_none());
        assert_eq!(controller.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn test_delta_after_cancel_is_dropped() {
        let dir = TempDir::new().unwrap();
        let controller = controller(ScriptedProvider::new(vec![], Ending::Done), &dir);

        let turn = controller.begin_turn("Hello".to_string()).unwrap();
        assert!(controller.apply_delta(&turn, "a"));
        controller.cancel_response();

        assert!(!controller.apply_delta(&turn, "b"));
        assert_eq!(controller.messages()[0].response_text.as_deref(), Some("a"));
        assert_eq!(controller.subscribe().borrow()[0].response_text.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_cancel_with_nothing_in_flight_is_noop() {
        let dir = TempDir::new().unwrap();
        let controller = controller(ScriptedProvider::new(vec![], Ending::Done), &dir);
        controller.cancel_response();
        assert_eq!(controller.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_keeps_partial_text_and_sets_error() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec!["par", "tial"], Ending::Fail);
        let controller = controller(provider, &dir);

        controller.send_message("Hello").await.unwrap();

        let message = &controller.messages()[0];
        assert_eq!(message.response_text.as_deref(), Some("partial"));
        assert_eq!(
            message.response_error.as_deref(),
            Some(crate::providers::error::GENERIC_FAILURE_MESSAGE)
        );
        assert_eq!(controller.phase(), SessionPhase::Error);
    }

    #[tokio::test]
    async fn test_busy_while_streaming() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec!["a"], Ending::WaitForCancel);
        let controller = controller(provider, &dir);
        let mut rx = controller.subscribe();

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.send_message("one").await })
        };
        rx.wait_for(|msgs| !msgs.is_empty()).await.unwrap();

        assert_eq!(controller.send_message("two").await, Err(SessionError::Busy));
        assert_eq!(controller.messages().len(), 1);

        controller.cancel_response();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_quota_only_decremented_on_success() {
        let dir = TempDir::new().unwrap();
        let quota = QuotaTracker::in_memory(10);

        let ok = controller(ScriptedProvider::new(vec!["fine"], Ending::Done), &dir)
            .with_quota(quota.clone());
        ok.send_message("Hello").await.unwrap();
        assert_eq!(quota.remaining_messages_today(), 9);

        let failing = controller(ScriptedProvider::new(vec![], Ending::FailUpFront), &dir)
            .with_quota(quota.clone());
        failing.send_message("Hello").await.unwrap();
        assert_eq!(quota.remaining_messages_today(), 9);
        assert!(failing.messages()[0].response_text.is_none());
        assert!(failing.messages()[0].response_error.is_some());
    }

    #[tokio::test]
    async fn test_session_saved_to_history_after_each_turn() {
        let dir = TempDir::new().unwrap();
        let history = HistoryStore::in_dir(dir.path());
        let controller = ChatSessionController::new(
            ScriptedProvider::new(vec!["Hi"], Ending::Done),
            history.clone(),
        );

        controller.send_message("Hello").await.unwrap();
        controller.send_message("Again").await.unwrap();

        let stored = history.get(controller.session().id).await.unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.api_model_type, ProviderId::ChatGpt);
        assert_eq!(history.load().await.len(), 1);
    }

    #[tokio::test]
    async fn test_share_text() {
        let dir = TempDir::new().unwrap();
        let controller = controller(ScriptedProvider::new(vec![], Ending::FailUpFront), &dir);
        controller.send_message("Hello").await.unwrap();

        assert_eq!(controller.share_text(), "User: Hello\nAI: No response\n\n");
    }
}
