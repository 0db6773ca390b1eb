//! Agent execution engine for runloop.
//!
//! `AgentEngine::execute` drives one call of the run state machine:
//!
//! ```text
//! CallLlm       stream the model, fold output, pick the next step
//! ExecuteTools  run immediate calls in proposal order, park gated ones
//! AwaitApproval checkpoint and return Paused
//! Complete      checkpoint and return Completed
//! ```
//!
//! Only `AwaitApproval` and `Complete` checkpoint. A run that fails in
//! between leaves the store at its previous checkpoint, so a retry from the
//! same previous id lands on the same thread. Lifecycle chunks go through
//! the same sink as model output.

use std::sync::Arc;

use runloop_types::agent::{AgentOutput, AgentStatus};
use runloop_types::chunk::{Chunk, RunEvent};
use runloop_types::config::EngineSection;
use runloop_types::llm::LlmRequest;
use runloop_types::message::{
    FunctionCallApprovalResponseMessage, FunctionCallMessage, Message, Meta, RunContext,
};
use runloop_types::run::Step;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::conversation::{BoxSummarizer, ConversationRunManager};
use crate::repository::ConversationPersistence;
use crate::stream::read_stream;
use crate::tool::ToolContext;
use crate::tool::orchestrator::{self, HandoffContinuation};

use super::definition::Agent;
use super::error::AgentError;
use super::{AgentInput, Runtime};

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Upper bound on LLM calls within one run.
    pub max_loops: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_loops: 10 }
    }
}

impl From<&EngineSection> for EngineConfig {
    fn from(section: &EngineSection) -> Self {
        Self {
            max_loops: section.max_loops,
        }
    }
}

/// Executes agent runs against a conversation store.
pub struct AgentEngine<P: ConversationPersistence> {
    persistence: Arc<P>,
    summarizer: Option<BoxSummarizer>,
    runtime: Option<Arc<dyn Runtime>>,
    config: EngineConfig,
}

impl<P: ConversationPersistence> AgentEngine<P> {
    pub fn new(persistence: Arc<P>, config: EngineConfig) -> Self {
        Self {
            persistence,
            summarizer: None,
            runtime: None,
            config,
        }
    }

    pub fn with_summarizer(mut self, summarizer: BoxSummarizer) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    /// Run `agent` on `input` until the run completes, pauses, or fails.
    ///
    /// Delegates to the configured [`Runtime`] when there is one.
    pub async fn execute(
        &self,
        agent: Arc<Agent>,
        input: AgentInput,
        cancel: &CancellationToken,
    ) -> Result<AgentOutput, AgentError> {
        match &self.runtime {
            Some(runtime) => runtime.run(agent, input, cancel.clone()).await,
            None => self.execute_local(agent, input, cancel).await,
        }
    }

    /// Run the state machine on the calling task.
    pub async fn execute_local(
        &self,
        agent: Arc<Agent>,
        input: AgentInput,
        cancel: &CancellationToken,
    ) -> Result<AgentOutput, AgentError> {
        let trace_id = Uuid::now_v7().to_string();
        let span = info_span!(
            "agent.execute",
            agent = %agent.name,
            namespace = %input.namespace,
            trace_id = %trace_id,
            run_id = tracing::field::Empty,
        );

        async move {
            let AgentInput {
                namespace,
                previous_message_id,
                messages,
                run_context,
                callback,
            } = input;

            let manager = ConversationRunManager::new_run(
                Arc::clone(&self.persistence),
                self.summarizer.clone(),
                &namespace,
                previous_message_id.as_deref(),
                messages,
            )
            .await
            .inspect_err(|e| warn!(error = %e, "run could not start"))?;
            tracing::Span::current().record("run_id", manager.run_id());

            let mut run = RunLoop {
                max_loops: self.config.max_loops,
                manager,
                agent,
                run_context,
                sink: callback,
                cancel,
                trace_id,
                produced: Vec::new(),
            };

            match run.drive().await {
                Ok(output) => Ok(output),
                Err(e) => {
                    warn!(error = %e, "run failed");
                    run.emit_failed(&e).await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}

impl<P: ConversationPersistence> std::fmt::Debug for AgentEngine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentEngine")
            .field("config", &self.config)
            .field("summarizer", &self.summarizer.is_some())
            .field("runtime", &self.runtime.is_some())
            .finish()
    }
}

/// State of one `execute` call.
struct RunLoop<'a, P: ConversationPersistence> {
    max_loops: u32,
    manager: ConversationRunManager<P>,
    agent: Arc<Agent>,
    run_context: RunContext,
    sink: Option<mpsc::Sender<Chunk>>,
    cancel: &'a CancellationToken,
    trace_id: String,
    /// Messages produced during this call, returned as `AgentOutput::output`.
    produced: Vec<Message>,
}

/// What a step decided.
enum StepOutcome {
    Continue,
    Finished(AgentOutput),
}

impl<P: ConversationPersistence> RunLoop<'_, P> {
    async fn drive(&mut self) -> Result<AgentOutput, AgentError> {
        if self.manager.is_fresh() {
            self.emit(Chunk::RunCreated(self.event(AgentStatus::InProgress)))
                .await;
        }
        self.emit(Chunk::RunInProgress(self.event(AgentStatus::InProgress)))
            .await;

        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let step = self.manager.run_state().current_step;
            debug!(
                %step,
                loop_iteration = self.manager.run_state().loop_iteration,
                "step"
            );
            let outcome = match step {
                Step::CallLlm => self.call_llm().await?,
                Step::ExecuteTools => self.execute_tools().await?,
                Step::AwaitApproval => StepOutcome::Finished(self.paused()),
                Step::Complete => StepOutcome::Finished(self.output(AgentStatus::Completed, vec![])),
            };
            if let StepOutcome::Finished(output) = outcome {
                return Ok(output);
            }
        }
    }

    async fn call_llm(&mut self) -> Result<StepOutcome, AgentError> {
        let iteration = self.manager.run_state().loop_iteration;
        if iteration >= self.max_loops {
            return Err(AgentError::MaxLoopsExceeded {
                max_loops: self.max_loops,
            });
        }

        let messages = self.manager.get_messages().await;
        let request = self.build_request(messages);
        let span = info_span!(
            "gen_ai.stream",
            gen_ai.system = self.agent.provider.name(),
            gen_ai.request.model = %request.model,
            gen_ai.request.temperature = ?request.temperature,
            loop_iteration = iteration,
        );

        let stream = self.agent.provider.stream(request);
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            result = read_stream(stream, self.sink.as_ref()).instrument(span) => result?,
        };

        let calls = result.function_calls();
        self.manager.add_messages(result.output.clone(), result.usage);
        self.produced.extend(result.output);

        if calls.is_empty() {
            self.manager.run_state_mut().transition_to_complete()?;
            return self.complete().await.map(StepOutcome::Finished);
        }

        let all_gated = calls.iter().all(|call| {
            self.agent
                .find_tool(&call.name)
                .is_some_and(|tool| tool.needs_approval())
        });
        if all_gated {
            self.manager
                .run_state_mut()
                .transition_to_await_approval(calls)?;
            return self.pause().await.map(StepOutcome::Finished);
        }

        self.manager
            .run_state_mut()
            .transition_to_execute_tools(calls)?;
        Ok(StepOutcome::Continue)
    }

    async fn execute_tools(&mut self) -> Result<StepOutcome, AgentError> {
        let pending = self.manager.run_state().pending_tool_calls.clone();

        match self.manager.take_approval_response() {
            Some(verdict) => {
                let mut handoff = self.resume_handoff();
                for call in &pending {
                    match verdict_for(&verdict, call) {
                        Verdict::Approved => {
                            if let Some(h) = self.run_call(call).await? {
                                handoff = Some(h);
                            }
                        }
                        Verdict::Rejected => self.append_output(orchestrator::decline(call)),
                        Verdict::Missing => {
                            warn!(
                                call_id = %call.call_id,
                                tool = %call.name,
                                "no verdict for pending call, declining"
                            );
                            self.append_output(orchestrator::decline(call));
                        }
                    }
                }
                self.finish_tools(handoff)
            }
            None => {
                let mut handoff = None;
                let (gated, immediate) = orchestrator::partition_by_approval(&self.agent.tools, pending);
                for call in &immediate {
                    if let Some(h) = self.run_call(call).await? {
                        handoff = Some(h);
                    }
                }
                if gated.is_empty() {
                    return self.finish_tools(handoff);
                }

                // The switch waits until the approved results are in.
                let state = self.manager.run_state_mut();
                state.pending_handoff = handoff.map(|h| h.name);
                state.defer_for_approval(gated);
                state.promote_awaiting_to_approval()?;
                self.pause().await.map(StepOutcome::Finished)
            }
        }
    }

    /// Apply the turn's handoff, if any, and go back to the model.
    fn finish_tools(&mut self, handoff: Option<HandoffContinuation>) -> Result<StepOutcome, AgentError> {
        if let Some(handoff) = handoff {
            info!(
                from = %self.agent.name,
                to = %handoff.target.name,
                "switching agent"
            );
            self.agent = handoff.target;
        }

        let state = self.manager.run_state_mut();
        state.clear_pending_tools();
        state.transition_to_llm()?;
        Ok(StepOutcome::Continue)
    }

    /// Resolve a handoff recorded before the run paused for approval.
    fn resume_handoff(&mut self) -> Option<HandoffContinuation> {
        let name = self.manager.run_state_mut().pending_handoff.take()?;
        match self.agent.find_handoff(&name) {
            Some(handoff) => Some(HandoffContinuation {
                name,
                target: Arc::clone(&handoff.target),
            }),
            None => {
                warn!(agent = %self.agent.name, target = %name, "paused handoff no longer available");
                None
            }
        }
    }

    /// Resolve one call and append its output.
    async fn run_call(
        &mut self,
        call: &FunctionCallMessage,
    ) -> Result<Option<HandoffContinuation>, AgentError> {
        let ctx = ToolContext {
            namespace: self.manager.namespace().to_string(),
            run_id: self.manager.run_id().to_string(),
            run_context: self.run_context.clone(),
        };
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            outcome = orchestrator::execute_call(&self.agent, call, &ctx) => outcome?,
        };
        self.append_output(outcome.output);
        Ok(outcome.handoff)
    }

    fn append_output(&mut self, output: runloop_types::message::FunctionCallOutputMessage) {
        let message = Message::FunctionCallOutput(output);
        self.produced.push(message.clone());
        self.manager.add_messages(vec![message], None);
    }

    async fn checkpoint(&mut self) -> Result<(), AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        self.manager.save_messages(Meta::new()).await?;
        Ok(())
    }

    async fn complete(&mut self) -> Result<AgentOutput, AgentError> {
        let run_id = self.manager.run_id().to_string();
        let event = self.event(AgentStatus::Completed);
        self.checkpoint().await?;
        info!(%run_id, "run completed");
        self.emit(Chunk::RunCompleted(event)).await;

        let mut output = self.output(AgentStatus::Completed, vec![]);
        output.run_id = run_id;
        Ok(output)
    }

    async fn pause(&mut self) -> Result<AgentOutput, AgentError> {
        self.checkpoint().await?;
        let pending = self.manager.run_state().pending_tool_calls.clone();
        info!(pending = pending.len(), "run paused for approval");

        let mut event = self.event(AgentStatus::Paused);
        event.pending_tool_calls = Some(pending);
        self.emit(Chunk::RunPaused(event)).await;
        Ok(self.paused())
    }

    fn paused(&self) -> AgentOutput {
        let pending = self.manager.run_state().pending_tool_calls.clone();
        self.output(AgentStatus::Paused, pending)
    }

    fn output(&self, status: AgentStatus, pending_approvals: Vec<FunctionCallMessage>) -> AgentOutput {
        AgentOutput {
            run_id: self.manager.run_id().to_string(),
            status,
            output: self.produced.clone(),
            pending_approvals,
        }
    }

    fn build_request(&self, input: Vec<Message>) -> LlmRequest {
        let instructions = self.agent.instruction.render(&self.run_context);
        LlmRequest {
            model: self.agent.model.clone(),
            instructions: (!instructions.is_empty()).then_some(instructions),
            input,
            tools: self.agent.tool_definitions(),
            temperature: self.agent.temperature,
            max_output_tokens: self.agent.max_output_tokens,
        }
    }

    fn event(&self, status: AgentStatus) -> RunEvent {
        RunEvent {
            run_id: self.manager.run_id().to_string(),
            status,
            trace_id: self.trace_id.clone(),
            usage: Some(self.manager.run_state().usage),
            pending_tool_calls: None,
            error: None,
        }
    }

    async fn emit(&self, chunk: Chunk) {
        let Some(sink) = &self.sink else { return };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => debug!("run cancelled, dropping lifecycle chunk"),
            sent = sink.send(chunk) => {
                if sent.is_err() {
                    debug!("chunk sink closed");
                }
            }
        }
    }

    async fn emit_failed(&self, error: &AgentError) {
        let mut event = self.event(AgentStatus::Error);
        event.error = Some(error.to_string());
        self.emit(Chunk::RunFailed(event)).await;
    }
}

enum Verdict {
    Approved,
    Rejected,
    Missing,
}

fn verdict_for(verdict: &FunctionCallApprovalResponseMessage, call: &FunctionCallMessage) -> Verdict {
    if verdict.approved_call_ids.contains(&call.call_id) {
        Verdict::Approved
    } else if verdict.rejected_call_ids.contains(&call.call_id) {
        Verdict::Rejected
    } else {
        Verdict::Missing
    }
}
