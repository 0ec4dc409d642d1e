//! Conversation orchestrator.
//!
//! The orchestrator runs one turn of a conversation:
//! 1. Load stored history and check ownership
//! 2. Append the user message (seeding the system prompt on first use)
//! 3. Ask the model for a reply, streaming or blocking
//! 4. Run any tools the model asked for and feed the results back
//! 5. Repeat until the model answers or the round ceiling is hit
//! 6. Persist the messages the turn produced
//!
//! Tool failures, malformed tool arguments and empty replies are recorded as
//! data. Only completion and store failures, ownership mismatches and
//! cancellation abort a turn, and an aborted turn persists nothing.

use crate::config::EngineConfig;
use crate::dispatch::{ToolDispatcher, parse_arguments};
use crate::error::TurnError;
use crate::event::{DoneReason, EventEmitter, TurnEvent};
use crate::round::{Resolution, Round};
use crate::transcript::Transcript;
use colloquy_ai::{CompletionError, CompletionRequest, CompletionService};
use colloquy_conversation::{
    HistoryStore, LoginContext, Message, ToolCallRequest, ToolDefinition, ToolExecutor,
    build_user_message,
};
use colloquy_core::{ConversationId, UserId};
use futures::StreamExt;
use rootcause::prelude::Report;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Reply text of a blocking turn that hit the round ceiling.
pub const ROUND_LIMIT_NOTICE: &str = "tool round limit reached";

/// Reply text of a blocking turn whose completion had no choices.
pub const EMPTY_RESPONSE_NOTICE: &str = "model returned an empty response";

/// Input of one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Conversation to continue or create.
    pub conversation_id: ConversationId,
    /// User driving the turn.
    pub user_id: UserId,
    /// User text. May be empty when an image is attached.
    pub text: String,
    /// Optional image bytes.
    pub image: Option<Vec<u8>>,
    /// Login data answered by the login lookup tool.
    pub login: Option<LoginContext>,
    /// Cancels the turn between suspension points.
    pub cancel: CancellationToken,
}

impl TurnRequest {
    /// Creates a text-only request.
    #[must_use]
    pub fn new(conversation_id: ConversationId, user_id: UserId, text: impl Into<String>) -> Self {
        Self {
            conversation_id,
            user_id,
            text: text.into(),
            image: None,
            login: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Attaches an image.
    #[must_use]
    pub fn with_image(mut self, image: Vec<u8>) -> Self {
        self.image = Some(image);
        self
    }

    /// Attaches login data.
    #[must_use]
    pub fn with_login(mut self, login: LoginContext) -> Self {
        self.login = Some(login);
        self
    }

    /// Uses a caller-owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns true if a non-empty image is attached.
    #[must_use]
    pub fn has_image(&self) -> bool {
        self.image.as_ref().is_some_and(|image| !image.is_empty())
    }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model produced a final answer.
    Completed,
    /// The round ceiling was reached.
    ToolRoundLimit,
    /// The model asked for tools but no call could be recovered.
    NoToolDetails,
    /// The completion had no choices.
    EmptyResponse,
}

impl TurnOutcome {
    /// Returns the reason reported in the final `done` event.
    #[must_use]
    pub fn done_reason(&self) -> DoneReason {
        match self {
            Self::Completed | Self::EmptyResponse => DoneReason::Completed,
            Self::ToolRoundLimit => DoneReason::ToolRoundLimit,
            Self::NoToolDetails => DoneReason::NoToolDetails,
        }
    }
}

impl From<DoneReason> for TurnOutcome {
    fn from(reason: DoneReason) -> Self {
        match reason {
            DoneReason::Completed => Self::Completed,
            DoneReason::ToolRoundLimit => Self::ToolRoundLimit,
            DoneReason::NoToolDetails => Self::NoToolDetails,
        }
    }
}

/// Result of a blocking turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    /// Final answer, or a fixed notice for policy stops.
    pub text: String,
    /// How the turn ended.
    pub outcome: TurnOutcome,
}

#[derive(Clone, Copy)]
enum Mode<'a> {
    Blocking,
    Streaming(&'a dyn EventEmitter),
}

impl Mode<'_> {
    fn emit(self, event: TurnEvent) {
        if let Self::Streaming(emitter) = self {
            let name = event.name();
            if let Err(e) = emitter.emit(event) {
                warn!(event = name, error = %e, "failed to emit turn event");
            }
        }
    }
}

enum Step {
    Round(Round),
    Empty,
}

/// Drives tool-calling turns against a completion service.
pub struct Orchestrator {
    config: EngineConfig,
    completion: Arc<dyn CompletionService>,
    history: Arc<dyn HistoryStore>,
    dispatcher: ToolDispatcher,
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        completion: Arc<dyn CompletionService>,
        history: Arc<dyn HistoryStore>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            config,
            completion,
            history,
            dispatcher: ToolDispatcher::new(tools),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs a blocking turn and returns the final reply.
    ///
    /// A request with an image is sent without tools.
    ///
    /// # Errors
    ///
    /// Returns an error if history cannot be loaded or saved, the completion
    /// service fails, the conversation belongs to another user, or the turn
    /// is cancelled.
    #[instrument(skip(self, request), fields(conversation_id = %request.conversation_id, user_id = %request.user_id))]
    pub async fn chat(&self, request: TurnRequest) -> Result<ChatReply, Report<TurnError>> {
        self.run(&request, Mode::Blocking).await
    }

    /// Runs a streaming turn, pushing events into `emitter`.
    ///
    /// Every turn that returns `Ok` has emitted a final `done` event.
    ///
    /// # Errors
    ///
    /// Same as [`Orchestrator::chat`]. Text already emitted is not retracted.
    #[instrument(skip(self, request, emitter), fields(conversation_id = %request.conversation_id, user_id = %request.user_id))]
    pub async fn chat_stream(
        &self,
        request: TurnRequest,
        emitter: &dyn EventEmitter,
    ) -> Result<TurnOutcome, Report<TurnError>> {
        self.run(&request, Mode::Streaming(emitter))
            .await
            .map(|reply| reply.outcome)
    }

    async fn run(&self, request: &TurnRequest, mode: Mode<'_>) -> Result<ChatReply, Report<TurnError>> {
        let mut transcript = self.open(request).await?;
        transcript.push(build_user_message(&request.text, request.image.as_deref()));

        let tools: Vec<ToolDefinition> = match mode {
            Mode::Blocking if request.has_image() => Vec::new(),
            _ => self.dispatcher.schema(),
        };

        let mut index = 0;
        loop {
            index += 1;
            if index > self.config.max_rounds {
                return self
                    .finish(
                        request,
                        &transcript,
                        mode,
                        TurnOutcome::ToolRoundLimit,
                        ROUND_LIMIT_NOTICE.to_string(),
                    )
                    .await;
            }

            ensure_live(&request.cancel, index)?;
            let completion = CompletionRequest::new(
                transcript.messages().to_vec(),
                self.config.completion.clone(),
            )
            .with_tools(tools.clone());

            let step = match mode {
                Mode::Blocking => self.complete_round(index, &completion, &request.cancel).await?,
                Mode::Streaming(emitter) => Step::Round(
                    self.stream_round(index, &completion, &request.cancel, emitter)
                        .await?,
                ),
            };

            let round = match step {
                Step::Round(round) => round,
                Step::Empty => {
                    warn!(round = index, "completion returned no choices");
                    return self
                        .finish(
                            request,
                            &transcript,
                            mode,
                            TurnOutcome::EmptyResponse,
                            EMPTY_RESPONSE_NOTICE.to_string(),
                        )
                        .await;
                }
            };

            match round.resolve() {
                Resolution::Tools { text, calls } => {
                    debug!(round = index, calls = calls.len(), "model requested tools");
                    let content = (!text.is_empty()).then_some(text);
                    transcript.push(Message::assistant_reply(content, calls.clone()));
                    mode.emit(TurnEvent::ToolCallStart {
                        round: index,
                        tool_calls: calls.clone(),
                    });
                    for call in &calls {
                        let result = self.run_tool(index, call, request, mode).await?;
                        transcript.push(Message::tool(call.id.clone(), result));
                    }
                }
                Resolution::Final { text, reason } => {
                    if !text.is_empty() {
                        transcript.push(Message::assistant(text.clone()));
                    }
                    return self
                        .finish(request, &transcript, mode, reason.into(), text)
                        .await;
                }
            }
        }
    }

    async fn open(&self, request: &TurnRequest) -> Result<Transcript, Report<TurnError>> {
        let stored = self
            .history
            .load(&request.conversation_id)
            .await
            .map_err(|e| TurnError::LoadFailed {
                conversation_id: request.conversation_id.clone(),
                reason: e.to_string(),
            })?;

        match stored {
            Some(conversation) => {
                conversation
                    .ensure_owner(&request.user_id)
                    .map_err(|_| TurnError::ConversationNotOwned {
                        conversation_id: request.conversation_id.clone(),
                        user_id: request.user_id.clone(),
                    })?;
                debug!(messages = conversation.messages.len(), "resuming conversation");
                Ok(Transcript::resume(conversation.messages))
            }
            None => {
                let mut transcript = Transcript::resume(Vec::new());
                if let Some(prompt) = &self.config.system_prompt {
                    transcript.push(Message::system(prompt.clone()));
                }
                debug!("starting new conversation");
                Ok(transcript)
            }
        }
    }

    async fn complete_round(
        &self,
        index: u32,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Step, Report<TurnError>> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Cancelled { round: index }.into()),
            response = self.completion.complete(request) => {
                response.map_err(|e| completion_failed(index, &e))?
            }
        };

        debug!(
            round = index,
            tokens = response.usage.total(),
            model = %response.model,
            "completion received"
        );
        Ok(match response.choice {
            Some(choice) => Step::Round(Round::from_choice(index, choice)),
            None => Step::Empty,
        })
    }

    async fn stream_round(
        &self,
        index: u32,
        request: &CompletionRequest,
        cancel: &CancellationToken,
        emitter: &dyn EventEmitter,
    ) -> Result<Round, Report<TurnError>> {
        let mut chunks = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Cancelled { round: index }.into()),
            stream = self.completion.stream(request) => {
                stream.map_err(|e| completion_failed(index, &e))?
            }
        };

        let mode = Mode::Streaming(emitter);
        let mut round = Round::new(index);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TurnError::Cancelled { round: index }.into()),
                next = chunks.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| completion_failed(index, &e))?;

            if !chunk.text.is_empty() {
                mode.emit(TurnEvent::Delta {
                    text: chunk.text.clone(),
                });
            }
            round.apply(&chunk);

            // Nothing after the tool signal is needed; dropping the stream closes it.
            if round.tool_signal() {
                debug!(round = index, "tool signal received, closing stream");
                break;
            }
        }
        Ok(round)
    }

    async fn run_tool(
        &self,
        index: u32,
        call: &ToolCallRequest,
        request: &TurnRequest,
        mode: Mode<'_>,
    ) -> Result<String, Report<TurnError>> {
        ensure_live(&request.cancel, index)?;

        let args = parse_arguments(call);
        mode.emit(TurnEvent::ToolCall {
            round: index,
            name: call.name.clone(),
            args: args.clone(),
        });

        let dispatched = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(TurnError::Cancelled { round: index }.into()),
            dispatched = self.dispatcher.call(call, &args, request.login.as_ref()) => dispatched,
        };

        debug!(round = index, tool = %call.name, failed = dispatched.failed, "tool call finished");
        mode.emit(TurnEvent::ToolResult {
            round: index,
            name: call.name.clone(),
            result: dispatched.output.clone(),
        });
        Ok(dispatched.output)
    }

    async fn finish(
        &self,
        request: &TurnRequest,
        transcript: &Transcript,
        mode: Mode<'_>,
        outcome: TurnOutcome,
        text: String,
    ) -> Result<ChatReply, Report<TurnError>> {
        let new_messages = transcript.new_messages();
        self.history
            .append_new(&request.conversation_id, &request.user_id, new_messages)
            .await
            .map_err(|e| TurnError::PersistFailed {
                conversation_id: request.conversation_id.clone(),
                reason: e.to_string(),
            })?;

        mode.emit(TurnEvent::Done {
            reason: outcome.done_reason(),
        });
        info!(?outcome, new_messages = new_messages.len(), "turn finished");
        Ok(ChatReply { text, outcome })
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn ensure_live(cancel: &CancellationToken, round: u32) -> Result<(), Report<TurnError>> {
    if cancel.is_cancelled() {
        return Err(TurnError::Cancelled { round }.into());
    }
    Ok(())
}

fn completion_failed(round: u32, err: &Report<CompletionError>) -> TurnError {
    TurnError::CompletionFailed {
        round,
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MAX_ROUNDS;
    use crate::dispatch::LOGIN_TOOL_NAME;
    use crate::error::EmitError;
    use async_trait::async_trait;
    use colloquy_ai::{
        ChunkStream, Choice, CompletionChunk, CompletionOptions, CompletionResponse, FinishReason,
        TokenUsage, ToolCallDelta,
    };
    use colloquy_conversation::message::check_tool_pairing;
    use colloquy_conversation::{
        Conversation, ConversationSummary, HistoryError, InMemoryHistoryStore, MessageBody,
        MessageRole, ToolArgs, ToolError, UserContent,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One scripted model reply.
    #[derive(Clone)]
    enum Reply {
        Answer {
            text: String,
            calls: Vec<ToolCallRequest>,
            finish: FinishReason,
        },
        Empty,
        Fail,
        /// Streams `text` and then never finishes; a blocking call never returns.
        Stall { text: String },
    }

    fn answer(text: &str) -> Reply {
        Reply::Answer {
            text: text.to_string(),
            calls: Vec::new(),
            finish: FinishReason::Stop,
        }
    }

    fn tools(calls: Vec<ToolCallRequest>) -> Reply {
        Reply::Answer {
            text: String::new(),
            calls,
            finish: FinishReason::ToolCalls,
        }
    }

    /// Completion service that plays back a script, then repeats `fallback`.
    struct ScriptedCompletion {
        script: Mutex<VecDeque<Reply>>,
        fallback: Option<Reply>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedCompletion {
        fn new(script: Vec<Reply>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback: None,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn always(reply: Reply) -> Self {
            Self {
                fallback: Some(reply),
                ..Self::new(Vec::new())
            }
        }

        fn next_reply(&self, request: &CompletionRequest) -> Reply {
            self.requests.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .or_else(|| self.fallback.clone())
                .unwrap_or(Reply::Fail)
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn scripted_failure() -> Report<CompletionError> {
        CompletionError::StreamFailed {
            reason: "connection reset".to_string(),
        }
        .into()
    }

    #[async_trait]
    impl CompletionService for ScriptedCompletion {
        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<CompletionResponse, Report<CompletionError>> {
            let choice = match self.next_reply(request) {
                Reply::Answer {
                    text,
                    calls,
                    finish,
                } => Some(Choice {
                    text,
                    tool_calls: calls,
                    finish_reason: finish,
                }),
                Reply::Empty => None,
                Reply::Fail => return Err(scripted_failure()),
                Reply::Stall { .. } => return futures::future::pending().await,
            };
            Ok(CompletionResponse {
                choice,
                usage: TokenUsage::default(),
                model: "scripted".to_string(),
            })
        }

        async fn stream(
            &self,
            request: &CompletionRequest,
        ) -> Result<ChunkStream, Report<CompletionError>> {
            let chunks = match self.next_reply(request) {
                Reply::Answer {
                    text,
                    calls,
                    finish,
                } => {
                    let mut chunks = Vec::new();
                    // Split text so deltas arrive in more than one piece.
                    let mid = text.char_indices().nth(text.chars().count() / 2).map_or(0, |(i, _)| i);
                    for piece in [&text[..mid], &text[mid..]] {
                        if !piece.is_empty() {
                            chunks.push(Ok(CompletionChunk::text(piece)));
                        }
                    }
                    for (index, call) in calls.into_iter().enumerate() {
                        chunks.push(Ok(CompletionChunk {
                            tool_calls: vec![ToolCallDelta {
                                index,
                                id: Some(call.id),
                                name: Some(call.name),
                                arguments: Some(call.arguments),
                            }],
                            ..CompletionChunk::default()
                        }));
                    }
                    chunks.push(Ok(CompletionChunk::finish(finish)));
                    // Anything after the finish chunk must never be read.
                    chunks.push(Ok(CompletionChunk::text("AFTER-FINISH")));
                    chunks
                }
                Reply::Empty => Vec::new(),
                Reply::Fail => vec![Err(scripted_failure())],
                Reply::Stall { text } => {
                    let head = futures::stream::iter(vec![Ok(CompletionChunk::text(text))]);
                    return Ok(head.chain(futures::stream::pending()).boxed());
                }
            };
            Ok(futures::stream::iter(chunks).boxed())
        }
    }

    /// History store that records every append.
    #[derive(Default)]
    struct RecordingHistory {
        inner: InMemoryHistoryStore,
        appends: Mutex<Vec<Vec<Message>>>,
        fail_appends: bool,
    }

    impl RecordingHistory {
        fn appends(&self) -> Vec<Vec<Message>> {
            self.appends.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HistoryStore for RecordingHistory {
        async fn load(
            &self,
            conversation_id: &ConversationId,
        ) -> Result<Option<Conversation>, Report<HistoryError>> {
            self.inner.load(conversation_id).await
        }

        async fn append_new(
            &self,
            conversation_id: &ConversationId,
            user_id: &UserId,
            messages: &[Message],
        ) -> Result<(), Report<HistoryError>> {
            self.appends.lock().unwrap().push(messages.to_vec());
            if self.fail_appends {
                return Err(HistoryError::AppendFailed {
                    conversation_id: conversation_id.clone(),
                    reason: "disk full".to_string(),
                }
                .into());
            }
            self.inner.append_new(conversation_id, user_id, messages).await
        }

        async fn list_for_user(
            &self,
            user_id: &UserId,
        ) -> Result<Vec<ConversationSummary>, Report<HistoryError>> {
            self.inner.list_for_user(user_id).await
        }
    }

    /// Tool executor with canned results that records calls.
    #[derive(Default)]
    struct RecordingTools {
        calls: Mutex<Vec<(String, ToolArgs)>>,
        /// Cancelled from inside the first call, when set.
        cancel_on_call: Mutex<Option<CancellationToken>>,
    }

    impl RecordingTools {
        fn cancel_on_call(&self, cancel: CancellationToken) {
            *self.cancel_on_call.lock().unwrap() = Some(cancel);
        }
    }

    #[async_trait]
    impl ToolExecutor for RecordingTools {
        fn schema(&self) -> Vec<ToolDefinition> {
            vec![
                ToolDefinition::new("X", "weather lookup"),
                ToolDefinition::new("Y", "always times out"),
            ]
        }

        async fn call(&self, name: &str, args: &ToolArgs) -> Result<String, ToolError> {
            self.calls.lock().unwrap().push((name.to_string(), args.clone()));
            if let Some(cancel) = self.cancel_on_call.lock().unwrap().take() {
                cancel.cancel();
            }
            match name {
                "X" => Ok("sunny".to_string()),
                "Y" => Err(ToolError::ExecutionFailed {
                    name: name.to_string(),
                    reason: "timeout".to_string(),
                }),
                other => Ok(format!("{other} done")),
            }
        }
    }

    /// Emitter that keeps every event.
    #[derive(Default)]
    struct CollectingEmitter {
        events: Mutex<Vec<TurnEvent>>,
    }

    impl CollectingEmitter {
        fn events(&self) -> Vec<TurnEvent> {
            self.events.lock().unwrap().clone()
        }

        fn names(&self) -> Vec<&'static str> {
            self.events().iter().map(TurnEvent::name).collect()
        }
    }

    impl EventEmitter for CollectingEmitter {
        fn emit(&self, event: TurnEvent) -> Result<(), Report<EmitError>> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct Harness {
        completion: Arc<ScriptedCompletion>,
        history: Arc<RecordingHistory>,
        tools: Arc<RecordingTools>,
        orchestrator: Orchestrator,
    }

    fn harness_with(config: EngineConfig, completion: ScriptedCompletion, history: RecordingHistory) -> Harness {
        let completion = Arc::new(completion);
        let history = Arc::new(history);
        let tools = Arc::new(RecordingTools::default());
        let orchestrator = Orchestrator::new(config, completion.clone(), history.clone(), tools.clone());
        Harness {
            completion,
            history,
            tools,
            orchestrator,
        }
    }

    fn harness(completion: ScriptedCompletion) -> Harness {
        harness_with(EngineConfig::default(), completion, RecordingHistory::default())
    }

    fn conv() -> ConversationId {
        ConversationId::new("c1")
    }

    fn user() -> UserId {
        UserId::new("u1")
    }

    fn request(text: &str) -> TurnRequest {
        TurnRequest::new(conv(), user(), text)
    }

    fn roles(messages: &[Message]) -> Vec<MessageRole> {
        messages.iter().map(Message::role).collect()
    }

    async fn stored(h: &Harness) -> Vec<Message> {
        h.history
            .load(&conv())
            .await
            .unwrap()
            .map(|c| c.messages)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn scenario_a_plain_reply_persists_user_and_assistant() {
        let h = harness(ScriptedCompletion::new(vec![answer("hi")]));

        let reply = h.orchestrator.chat(request("hello")).await.unwrap();

        assert_eq!(
            reply,
            ChatReply {
                text: "hi".to_string(),
                outcome: TurnOutcome::Completed
            }
        );
        let messages = stored(&h).await;
        assert_eq!(roles(&messages), vec![MessageRole::User, MessageRole::Assistant]);
        assert_eq!(messages[0].text(), Some("hello"));
        assert_eq!(messages[1].text(), Some("hi"));
        assert_eq!(h.history.appends().len(), 1);
    }

    #[tokio::test]
    async fn scenario_a_streaming_emits_deltas_then_done() {
        let h = harness(ScriptedCompletion::new(vec![answer("hello there")]));
        let emitter = CollectingEmitter::default();

        let outcome = h.orchestrator.chat_stream(request("hello"), &emitter).await.unwrap();

        assert_eq!(outcome, TurnOutcome::Completed);
        let events = emitter.events();
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::Delta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello there");
        assert_eq!(
            events.last(),
            Some(&TurnEvent::Done {
                reason: DoneReason::Completed
            })
        );
        assert_eq!(stored(&h).await[1].text(), Some("hello there"));
    }

    #[tokio::test]
    async fn scenario_b_tool_round_feeds_result_into_next_round() {
        let h = harness(ScriptedCompletion::new(vec![
            tools(vec![ToolCallRequest::new("call_1", "X", r#"{"q":"weather"}"#)]),
            answer("It is sunny."),
        ]));

        let reply = h.orchestrator.chat(request("weather?")).await.unwrap();
        assert_eq!(reply.text, "It is sunny.");

        let messages = stored(&h).await;
        assert_eq!(
            roles(&messages),
            vec![
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::Tool,
                MessageRole::Assistant
            ]
        );
        assert_eq!(messages[1].tool_calls()[0].name, "X");
        assert_eq!(
            messages[2].body,
            MessageBody::Tool {
                tool_call_id: "call_1".to_string(),
                content: "sunny".to_string()
            }
        );

        let calls = h.tools.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.get_str("q"), Some("weather"));

        // Round 2 sees the tool result.
        let requests = h.completion.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages.len(), 3);
        assert_eq!(requests[1].messages[2].role(), MessageRole::Tool);
    }

    #[tokio::test]
    async fn scenario_b_streaming_event_order() {
        let h = harness(ScriptedCompletion::new(vec![
            tools(vec![ToolCallRequest::new("call_1", "X", r#"{"q":"weather"}"#)]),
            answer("sunny"),
        ]));
        let emitter = CollectingEmitter::default();

        h.orchestrator.chat_stream(request("weather?"), &emitter).await.unwrap();

        assert_eq!(
            emitter.names(),
            vec!["tool_call_start", "tool_call", "tool_result", "delta", "delta", "done"]
        );
        let events = emitter.events();
        assert_eq!(
            events[1],
            TurnEvent::ToolCall {
                round: 1,
                name: "X".to_string(),
                args: ToolArgs::parse(r#"{"q":"weather"}"#),
            }
        );
        assert_eq!(
            events[2],
            TurnEvent::ToolResult {
                round: 1,
                name: "X".to_string(),
                result: "sunny".to_string(),
            }
        );
        // The chunk after the tool signal was never read.
        assert!(!events.iter().any(|e| matches!(e, TurnEvent::Delta { text } if text.contains("AFTER-FINISH"))));
    }

    #[tokio::test]
    async fn scenario_c_round_limit_stops_and_persists() {
        let h = harness(ScriptedCompletion::always(tools(vec![ToolCallRequest::new(
            "call", "X", "{}",
        )])));

        let reply = h.orchestrator.chat(request("loop forever")).await.unwrap();

        assert_eq!(reply.outcome, TurnOutcome::ToolRoundLimit);
        assert_eq!(reply.text, ROUND_LIMIT_NOTICE);
        assert_eq!(h.completion.requests().len(), DEFAULT_MAX_ROUNDS as usize);

        let appends = h.history.appends();
        assert_eq!(appends.len(), 1);
        // user + (assistant + tool) per round
        assert_eq!(appends[0].len(), 1 + 2 * DEFAULT_MAX_ROUNDS as usize);
        assert_eq!(check_tool_pairing(&appends[0]), Ok(()));
    }

    #[tokio::test]
    async fn scenario_c_streaming_reports_round_limit() {
        let h = harness_with(
            EngineConfig::default().with_max_rounds(3),
            ScriptedCompletion::always(tools(vec![ToolCallRequest::new("call", "X", "{}")])),
            RecordingHistory::default(),
        );
        let emitter = CollectingEmitter::default();

        let outcome = h.orchestrator.chat_stream(request("loop"), &emitter).await.unwrap();

        assert_eq!(outcome, TurnOutcome::ToolRoundLimit);
        assert_eq!(h.completion.requests().len(), 3);
        assert_eq!(
            emitter.events().last(),
            Some(&TurnEvent::Done {
                reason: DoneReason::ToolRoundLimit
            })
        );
        let rounds: Vec<u32> = emitter
            .events()
            .iter()
            .filter_map(|e| match e {
                TurnEvent::ToolCallStart { round, .. } => Some(*round),
                _ => None,
            })
            .collect();
        assert_eq!(rounds, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn scenario_d_tool_error_becomes_result_text() {
        let h = harness(ScriptedCompletion::new(vec![
            tools(vec![ToolCallRequest::new("call_1", "Y", "{}")]),
            answer("The tool timed out."),
        ]));

        let reply = h.orchestrator.chat(request("try Y")).await.unwrap();

        assert_eq!(reply.outcome, TurnOutcome::Completed);
        let messages = stored(&h).await;
        assert_eq!(messages[2].text(), Some("tool error: timeout"));
        assert_eq!(messages[3].text(), Some("The tool timed out."));
    }

    #[tokio::test]
    async fn tool_results_follow_request_order() {
        let h = harness(ScriptedCompletion::new(vec![
            tools(vec![
                ToolCallRequest::new("a", "X", "{}"),
                ToolCallRequest::new("b", "Y", "{}"),
                ToolCallRequest::new("c", "Z", "not json"),
            ]),
            answer("done"),
        ]));

        h.orchestrator.chat(request("three tools")).await.unwrap();

        let messages = stored(&h).await;
        let ids: Vec<_> = messages[2..5]
            .iter()
            .map(|m| match &m.body {
                MessageBody::Tool { tool_call_id, .. } => tool_call_id.clone(),
                other => panic!("expected tool message, got {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(check_tool_pairing(&messages), Ok(()));

        let calls = h.tools.calls.lock().unwrap().clone();
        let names: Vec<_> = calls.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["X", "Y", "Z"]);
        assert!(calls[2].1.is_fallback());
    }

    #[tokio::test]
    async fn only_new_messages_are_persisted() {
        let history = RecordingHistory::default();
        history
            .inner
            .insert(Conversation::new(
                conv(),
                user(),
                vec![Message::user("earlier"), Message::assistant("reply")],
            ))
            .await;
        let h = harness_with(
            EngineConfig::default(),
            ScriptedCompletion::new(vec![answer("again")]),
            history,
        );

        h.orchestrator.chat(request("once more")).await.unwrap();

        let appends = h.history.appends();
        assert_eq!(appends.len(), 1);
        assert_eq!(roles(&appends[0]), vec![MessageRole::User, MessageRole::Assistant]);
        assert_eq!(stored(&h).await.len(), 4);
        // The model saw the stored history.
        assert_eq!(h.completion.requests()[0].messages.len(), 3);
    }

    #[tokio::test]
    async fn system_prompt_is_seeded_only_on_creation() {
        let h = harness_with(
            EngineConfig::default().with_system_prompt("be brief"),
            ScriptedCompletion::new(vec![answer("hi"), answer("still here")]),
            RecordingHistory::default(),
        );

        h.orchestrator.chat(request("hello")).await.unwrap();
        h.orchestrator.chat(request("you there?")).await.unwrap();

        let appends = h.history.appends();
        assert_eq!(
            roles(&appends[0]),
            vec![MessageRole::System, MessageRole::User, MessageRole::Assistant]
        );
        assert_eq!(roles(&appends[1]), vec![MessageRole::User, MessageRole::Assistant]);
        assert_eq!(stored(&h).await.len(), 5);
    }

    #[tokio::test]
    async fn blocking_image_turn_offers_no_tools() {
        let h = harness(ScriptedCompletion::new(vec![answer("a cat")]));

        h.orchestrator
            .chat(request("what is this").with_image(vec![0xFF, 0xD8, 0xFF, 0xE0]))
            .await
            .unwrap();

        let requests = h.completion.requests();
        assert!(requests[0].tools.is_empty());
        match &requests[0].messages[0].body {
            MessageBody::User {
                content: UserContent::Parts(parts),
            } => assert_eq!(parts.len(), 2),
            other => panic!("expected multimodal user message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn streaming_image_turn_still_offers_tools() {
        let h = harness(ScriptedCompletion::new(vec![answer("a cat")]));
        let emitter = CollectingEmitter::default();

        h.orchestrator
            .chat_stream(request("what is this").with_image(vec![0xFF, 0xD8, 0xFF]), &emitter)
            .await
            .unwrap();

        let offered: Vec<_> = h.completion.requests()[0]
            .tools
            .iter()
            .map(|t| t.name.clone())
            .collect();
        assert!(offered.contains(&"X".to_string()));
        assert!(offered.contains(&LOGIN_TOOL_NAME.to_string()));
    }

    #[tokio::test]
    async fn tool_signal_without_calls_ends_with_no_tool_details() {
        let h = harness(ScriptedCompletion::new(vec![Reply::Answer {
            text: "let me look".to_string(),
            calls: Vec::new(),
            finish: FinishReason::ToolCalls,
        }]));
        let emitter = CollectingEmitter::default();

        let outcome = h.orchestrator.chat_stream(request("hi"), &emitter).await.unwrap();

        assert_eq!(outcome, TurnOutcome::NoToolDetails);
        assert_eq!(
            emitter.events().last(),
            Some(&TurnEvent::Done {
                reason: DoneReason::NoToolDetails
            })
        );
        let messages = stored(&h).await;
        assert_eq!(roles(&messages), vec![MessageRole::User, MessageRole::Assistant]);
        assert_eq!(messages[1].text(), Some("let me look"));
    }

    #[tokio::test]
    async fn empty_choices_yield_notice_and_persist_user_message() {
        let h = harness(ScriptedCompletion::new(vec![Reply::Empty]));

        let reply = h.orchestrator.chat(request("hello")).await.unwrap();

        assert_eq!(reply.outcome, TurnOutcome::EmptyResponse);
        assert_eq!(reply.text, EMPTY_RESPONSE_NOTICE);
        assert_eq!(roles(&stored(&h).await), vec![MessageRole::User]);
    }

    #[tokio::test]
    async fn completion_failure_aborts_without_persisting() {
        let h = harness(ScriptedCompletion::new(vec![
            tools(vec![ToolCallRequest::new("a", "X", "{}")]),
            Reply::Fail,
        ]));

        let err = h.orchestrator.chat(request("hello")).await.unwrap_err();

        assert!(err.to_string().contains("completion failed in round 2"));
        assert!(h.history.appends().is_empty());
        assert!(h.history.load(&conv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn streaming_failure_keeps_emitted_deltas() {
        let h = harness(ScriptedCompletion::new(vec![Reply::Fail]));
        let emitter = CollectingEmitter::default();

        let result = h.orchestrator.chat_stream(request("hello"), &emitter).await;

        assert!(result.is_err());
        assert!(!emitter.names().contains(&"done"));
        assert!(h.history.appends().is_empty());
    }

    #[tokio::test]
    async fn other_users_conversation_is_rejected() {
        let history = RecordingHistory::default();
        history
            .inner
            .insert(Conversation::new(conv(), user(), vec![Message::user("mine")]))
            .await;
        let h = harness_with(
            EngineConfig::default(),
            ScriptedCompletion::new(vec![answer("hi")]),
            history,
        );

        let err = h
            .orchestrator
            .chat(TurnRequest::new(conv(), UserId::new("u2"), "let me in"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("not owned by u2"));
        assert!(h.completion.requests().is_empty());
        assert!(h.history.appends().is_empty());
    }

    #[tokio::test]
    async fn cancelled_turn_stops_before_completion() {
        let h = harness(ScriptedCompletion::new(vec![answer("hi")]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .orchestrator
            .chat(request("hello").with_cancellation(cancel))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("cancelled"));
        assert!(h.completion.requests().is_empty());
        assert!(h.history.appends().is_empty());
    }

    #[tokio::test]
    async fn cancellation_between_tool_calls_skips_the_rest() {
        let h = harness(ScriptedCompletion::new(vec![
            tools(vec![
                ToolCallRequest::new("a", "X", "{}"),
                ToolCallRequest::new("b", "X", "{}"),
            ]),
            answer("never asked"),
        ]));
        let cancel = CancellationToken::new();
        h.tools.cancel_on_call(cancel.clone());

        let err = h
            .orchestrator
            .chat(request("two tools").with_cancellation(cancel))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("cancelled in round 1"));
        assert_eq!(h.tools.calls.lock().unwrap().len(), 1);
        assert_eq!(h.completion.requests().len(), 1);
        assert!(h.history.appends().is_empty());
    }

    #[tokio::test]
    async fn streaming_cancellation_between_tool_calls_emits_no_done() {
        let h = harness(ScriptedCompletion::new(vec![
            tools(vec![
                ToolCallRequest::new("a", "X", "{}"),
                ToolCallRequest::new("b", "X", "{}"),
            ]),
            answer("never asked"),
        ]));
        let cancel = CancellationToken::new();
        h.tools.cancel_on_call(cancel.clone());
        let emitter = CollectingEmitter::default();

        let result = h
            .orchestrator
            .chat_stream(request("two tools").with_cancellation(cancel), &emitter)
            .await;

        assert!(result.is_err());
        assert_eq!(emitter.names(), vec!["tool_call_start", "tool_call", "tool_result"]);
        assert!(h.history.appends().is_empty());
    }

    #[tokio::test]
    async fn cancellation_while_reading_stream_stops_the_turn() {
        struct CancellingEmitter {
            inner: CollectingEmitter,
            cancel: CancellationToken,
        }

        impl EventEmitter for CancellingEmitter {
            fn emit(&self, event: TurnEvent) -> Result<(), Report<EmitError>> {
                if matches!(event, TurnEvent::Delta { .. }) {
                    self.cancel.cancel();
                }
                self.inner.emit(event)
            }
        }

        let h = harness(ScriptedCompletion::new(vec![Reply::Stall {
            text: "thinking".to_string(),
        }]));
        let cancel = CancellationToken::new();
        let emitter = CancellingEmitter {
            inner: CollectingEmitter::default(),
            cancel: cancel.clone(),
        };

        let err = h
            .orchestrator
            .chat_stream(request("hello").with_cancellation(cancel), &emitter)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("cancelled in round 1"));
        assert_eq!(
            emitter.inner.events(),
            vec![TurnEvent::Delta {
                text: "thinking".to_string()
            }]
        );
        assert!(h.history.appends().is_empty());
    }

    #[tokio::test]
    async fn cancellation_interrupts_pending_completion() {
        let h = harness(ScriptedCompletion::new(vec![Reply::Stall {
            text: String::new(),
        }]));
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                cancel.cancel();
            }
        });

        let err = h
            .orchestrator
            .chat(request("hello").with_cancellation(cancel))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("cancelled in round 1"));
        assert_eq!(h.completion.requests().len(), 1);
        assert!(h.history.appends().is_empty());
    }

    #[tokio::test]
    async fn login_tool_uses_request_login() {
        let h = harness(ScriptedCompletion::new(vec![
            tools(vec![ToolCallRequest::new("l1", LOGIN_TOOL_NAME, "")]),
            answer("got it"),
        ]));
        let login = LoginContext::new(user(), "sid=abc");

        h.orchestrator
            .chat(request("who am i").with_login(login))
            .await
            .unwrap();

        let messages = stored(&h).await;
        let value: serde_json::Value = serde_json::from_str(messages[2].text().unwrap()).unwrap();
        assert_eq!(value["id"], "u1");
        assert_eq!(value["cookie"], "sid=abc");
        assert!(h.tools.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn emission_failures_do_not_fail_the_turn() {
        struct BrokenEmitter;

        impl EventEmitter for BrokenEmitter {
            fn emit(&self, _event: TurnEvent) -> Result<(), Report<EmitError>> {
                Err(EmitError::Closed.into())
            }
        }

        let h = harness(ScriptedCompletion::new(vec![answer("hi")]));
        let outcome = h
            .orchestrator
            .chat_stream(request("hello"), &BrokenEmitter)
            .await
            .unwrap();

        assert_eq!(outcome, TurnOutcome::Completed);
        assert_eq!(stored(&h).await.len(), 2);
    }

    #[tokio::test]
    async fn persistence_failure_is_reported() {
        let history = RecordingHistory {
            fail_appends: true,
            ..RecordingHistory::default()
        };
        let h = harness_with(
            EngineConfig::default(),
            ScriptedCompletion::new(vec![answer("hi")]),
            history,
        );

        let err = h.orchestrator.chat(request("hello")).await.unwrap_err();

        assert!(err.to_string().contains("failed to persist conversation c1"));
        assert_eq!(h.history.appends().len(), 1);
    }

    #[tokio::test]
    async fn completion_options_are_forwarded() {
        let options = CompletionOptions::new("small-model").with_temperature(0.2);
        let h = harness_with(
            EngineConfig::default().with_completion(options.clone()),
            ScriptedCompletion::new(vec![answer("hi")]),
            RecordingHistory::default(),
        );

        h.orchestrator.chat(request("hello")).await.unwrap();

        assert_eq!(h.completion.requests()[0].options, options);
    }
}
