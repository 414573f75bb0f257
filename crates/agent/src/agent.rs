use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::config::AgentDefaults;
use switchboard_core::types::{ChatMessage, LLMResponse};
use switchboard_core::{Error, InboundMessage, OutboundMessage, Result};
use switchboard_providers::Provider;
use switchboard_skills::SkillRegistry;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::context::ContextBuilder;
use crate::session::{Session, SessionStore};

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// The model answered without further tool calls.
    Completed,
    /// The iteration cap was hit with tool calls still pending.
    Truncated,
    /// The provider failed; only the user turn was recorded.
    Failed,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub status: TurnStatus,
    pub tool_calls: usize,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_tool_iterations: u32,
    pub llm_max_retries: u32,
    pub llm_retry_delay_ms: u64,
}

impl From<&AgentDefaults> for AgentSettings {
    fn from(d: &AgentDefaults) -> Self {
        Self {
            max_tool_iterations: d.max_tool_iterations.max(1),
            llm_max_retries: d.llm_max_retries,
            llm_retry_delay_ms: d.llm_retry_delay_ms,
        }
    }
}

/// Drives one inbound message through prompt assembly, the tool loop and the
/// reply.
pub struct Agent {
    provider: Arc<dyn Provider>,
    skills: Arc<SkillRegistry>,
    sessions: Arc<SessionStore>,
    context: ContextBuilder,
    bus: MessageBus,
    settings: AgentSettings,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn Provider>,
        skills: Arc<SkillRegistry>,
        sessions: Arc<SessionStore>,
        context: ContextBuilder,
        bus: MessageBus,
        settings: AgentSettings,
    ) -> Self {
        Self {
            provider,
            skills,
            sessions,
            context,
            bus,
            settings,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn skills(&self) -> &Arc<SkillRegistry> {
        &self.skills
    }

    /// Runs a turn for `msg` and publishes the reply to its channel. The
    /// reply is queued before the session is released, so the next turn on
    /// the same key cannot overtake it.
    pub async fn dispatch(&self, msg: InboundMessage, cancel: &CancellationToken) -> Result<()> {
        let key = msg.session_key();
        let content = user_content(&msg);
        let mut session = self.lock_session(&key, cancel).await?;
        let outcome = self
            .turn(&mut session, &key, &msg.channel_id, &content, cancel)
            .await?;

        if outcome.reply.trim().is_empty() {
            debug!(session = %key, "Empty reply, nothing to send");
            return Ok(());
        }
        let reply = OutboundMessage::reply_to(&msg, &outcome.reply);
        self.bus.publish_outbound(reply).await
    }

    /// One turn against the session `key`. The session lock is held for the
    /// whole turn, so turns on the same key run one after another.
    pub async fn run_turn(
        &self,
        key: &str,
        channel: &str,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let mut session = self.lock_session(key, cancel).await?;
        self.turn(&mut session, key, channel, user_text, cancel).await
    }

    async fn lock_session(&self, key: &str, cancel: &CancellationToken) -> Result<OwnedMutexGuard<Session>> {
        let handle = self.sessions.get_or_create(key);
        tokio::select! {
            guard = handle.lock_owned() => Ok(guard),
            _ = cancel.cancelled() => Err(Error::Cancelled(format!("turn on {} cancelled", key))),
        }
    }

    async fn turn(
        &self,
        session: &mut Session,
        key: &str,
        channel: &str,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        session.touch();

        let tools = self.skills.tool_schemas();
        let summaries = self.skills.summaries();
        let mut messages = self
            .context
            .build_messages(&session.history, user_text, &summaries, channel);
        let turn_start = messages.len() - 1;
        let max_iterations = self.settings.max_tool_iterations;
        let mut tool_calls = 0usize;

        info!(session = %key, history = session.history.len(), tools = tools.len(), "Agent turn started");

        for iteration in 0..max_iterations {
            debug!(iteration, "LLM call iteration");

            let response = match self.chat_with_retry(&messages, &tools, cancel).await {
                Ok(r) => r,
                Err(e) => {
                    session.history.push(messages[turn_start].clone());
                    session.touch();
                    if matches!(e, Error::Cancelled(_)) {
                        return Err(e);
                    }
                    warn!(session = %key, error = %e, "LLM call failed after all retries");
                    return Ok(TurnOutcome {
                        reply: format!(
                            "Sorry, I ran into a problem talking to the language model ({} retries): {}",
                            self.settings.llm_max_retries, e
                        ),
                        status: TurnStatus::Failed,
                        tool_calls,
                    });
                }
            };

            info!(
                content_len = response.content.as_ref().map(|c| c.len()).unwrap_or(0),
                tool_calls_count = response.tool_calls.len(),
                finish_reason = %response.finish_reason,
                "LLM response received"
            );

            if response.tool_calls.is_empty() {
                let reply = response.content.unwrap_or_default();
                messages.push(ChatMessage::assistant(&reply));
                session.history.extend(messages.drain(turn_start..));
                session.touch();
                return Ok(TurnOutcome {
                    reply,
                    status: TurnStatus::Completed,
                    tool_calls,
                });
            }

            let calls = response.tool_calls;
            messages.push(ChatMessage::assistant_with_tool_calls(
                response.content.as_deref().unwrap_or(""),
                calls.clone(),
            ));
            for call in &calls {
                info!(tool = %call.name, id = %call.id, "Invoking skill");
                let outcome = self.skills.invoke(&call.name, &call.arguments, cancel).await;
                if cancel.is_cancelled() {
                    session.history.push(messages[turn_start].clone());
                    session.touch();
                    return Err(Error::Cancelled(format!("turn on {} cancelled", key)));
                }
                let content = if outcome.is_error {
                    format!("Error: {}", outcome.content)
                } else {
                    outcome.content
                };
                messages.push(ChatMessage::tool_result(&call.id, &call.name, &content));
                tool_calls += 1;
            }
        }

        warn!(session = %key, max_iterations, "Reached max tool iterations");
        let reply = format!(
            "I've reached the maximum number of tool iterations ({}) without a final answer.",
            max_iterations
        );
        messages.push(ChatMessage::assistant(&reply));
        session.history.extend(messages.drain(turn_start..));
        session.touch();
        Ok(TurnOutcome {
            reply,
            status: TurnStatus::Truncated,
            tool_calls,
        })
    }

    async fn chat_with_retry(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        cancel: &CancellationToken,
    ) -> Result<LLMResponse> {
        let max_retries = self.settings.llm_max_retries;
        let base_delay_ms = self.settings.llm_retry_delay_ms;
        let mut last_error = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay_ms = base_delay_ms * (1u64 << (attempt - 1).min(4));
                warn!(attempt, max_retries, delay_ms, "Retrying LLM call after transient error");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    _ = cancel.cancelled() => return Err(Error::Cancelled("LLM retry cancelled".into())),
                }
            }
            let result = tokio::select! {
                r = self.provider.chat(messages, tools) => r,
                _ = cancel.cancelled() => return Err(Error::Cancelled("LLM call cancelled".into())),
            };
            match result {
                Ok(r) => {
                    if attempt > 0 {
                        info!(attempt, "LLM call succeeded after retry");
                    }
                    return Ok(r);
                }
                Err(e) => {
                    warn!(error = %e, attempt, max_retries, "LLM call failed");
                    let retryable = matches!(e, Error::Provider(_)) || e.is_transient();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Provider("no response".into())))
    }
}

/// Message text plus a line per attachment so the model knows they exist.
fn user_content(msg: &InboundMessage) -> String {
    let mut content = msg.content.clone();
    for a in &msg.attachments {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(&format!("[attachment: {} ({}, {} bytes)]", a.filename, a.mime, a.data.len()));
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use switchboard_core::types::ToolCallRequest;
    use switchboard_core::{Attachment, Workspace};
    use switchboard_skills::SkillHandler;
    use tempfile::TempDir;

    /// Replays scripted responses; falls back to echoing the last user or
    /// tool message.
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<LLMResponse>>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
        delay: Duration,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<LLMResponse>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn chat(&self, messages: &[ChatMessage], _tools: &[Value]) -> Result<LLMResponse> {
            self.seen.lock().unwrap().push(messages.to_vec());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(next) = self.script.lock().unwrap().pop_front() {
                return next;
            }
            let last = messages.last().map(|m| m.text()).unwrap_or_default();
            Ok(text(&format!("echo: {}", last)))
        }
    }

    fn text(content: &str) -> LLMResponse {
        LLMResponse {
            content: Some(content.to_string()),
            finish_reason: "stop".into(),
            ..Default::default()
        }
    }

    fn call(name: &str, args: Value) -> LLMResponse {
        LLMResponse {
            tool_calls: vec![ToolCallRequest {
                id: format!("call_{}", name),
                name: name.to_string(),
                arguments: args,
            }],
            finish_reason: "tool_calls".into(),
            ..Default::default()
        }
    }

    struct AddHandler;

    #[async_trait]
    impl SkillHandler for AddHandler {
        async fn call(&self, args: Value) -> Result<Value> {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        }
    }

    struct Harness {
        _tmp: TempDir,
        agent: Arc<Agent>,
        provider: Arc<ScriptedProvider>,
        bus: MessageBus,
    }

    fn harness(provider: ScriptedProvider, max_iterations: u32) -> Harness {
        let tmp = TempDir::new().unwrap();
        let ws = tmp.path().join("ws");
        let global = tmp.path().join("global");
        let builtin = tmp.path().join("builtin");
        let add = ws.join("skills").join("add");
        std::fs::create_dir_all(&add).unwrap();
        std::fs::create_dir_all(&global).unwrap();
        std::fs::create_dir_all(&builtin).unwrap();
        std::fs::write(
            add.join("manifest.json"),
            json!({
                "name": "add",
                "description": "Add two integers",
                "parameters": {
                    "type": "object",
                    "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                    "required": ["a", "b"]
                },
                "entrypoint": {"type": "handler", "name": "add"}
            })
            .to_string(),
        )
        .unwrap();

        let registry = Arc::new(SkillRegistry::new(ws.join("skills"), global, builtin));
        registry.register_handler("add", Arc::new(AddHandler));
        registry.reload();

        let provider = Arc::new(provider);
        let bus = MessageBus::new(16);
        let agent = Agent::new(
            provider.clone(),
            registry,
            Arc::new(SessionStore::new()),
            ContextBuilder::new(Workspace::new(&ws), &[], 8000),
            bus.clone(),
            AgentSettings {
                max_tool_iterations: max_iterations,
                llm_max_retries: 1,
                llm_retry_delay_ms: 1,
            },
        );
        Harness {
            _tmp: tmp,
            agent: Arc::new(agent),
            provider,
            bus,
        }
    }

    async fn history(agent: &Agent, key: &str) -> Vec<ChatMessage> {
        agent.sessions().get(key).unwrap().lock().await.history.clone()
    }

    #[tokio::test]
    async fn test_dispatch_publishes_reply_to_origin() {
        let h = harness(ScriptedProvider::new(vec![]), 8);
        let mut out = h.bus.subscribe_outbound("telegram").unwrap();
        let mut msg = InboundMessage::new("telegram", "42", "42", "hi");
        msg.metadata.insert("message_id".into(), "m1".into());

        h.agent.dispatch(msg, &CancellationToken::new()).await.unwrap();

        let reply = out.recv().await.unwrap();
        assert_eq!(reply.chat_id, "42");
        assert_eq!(reply.content, "echo: hi");
        assert_eq!(reply.reply_to_message_id.as_deref(), Some("m1"));

        let hist = history(&h.agent, "telegram:42").await;
        assert_eq!(hist.len(), 2);
        assert_eq!(hist.last().unwrap().role, "assistant");
    }

    #[tokio::test]
    async fn test_tool_loop_invokes_skill() {
        let h = harness(
            ScriptedProvider::new(vec![Ok(call("add", json!({"a": 2, "b": 3})))]),
            8,
        );
        let outcome = h
            .agent
            .run_turn("telegram:1", "telegram", "what is 2+3", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.tool_calls, 1);
        assert!(outcome.reply.contains('5'));

        let hist = history(&h.agent, "telegram:1").await;
        let roles: Vec<_> = hist.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["user", "assistant", "tool", "assistant"]);
        assert_eq!(hist[2].text(), "5");
    }

    #[tokio::test]
    async fn test_schema_violation_reaches_model_as_error() {
        let h = harness(
            ScriptedProvider::new(vec![Ok(call("add", json!({"a": "two"})))]),
            8,
        );
        h.agent
            .run_turn("k", "telegram", "add", &CancellationToken::new())
            .await
            .unwrap();
        let hist = history(&h.agent, "k").await;
        assert!(hist[2].text().starts_with("Error: invalid arguments"));
    }

    #[tokio::test]
    async fn test_iteration_cap_emits_diagnostic() {
        let looping = (0..5).map(|_| Ok(call("add", json!({"a": 1, "b": 1})))).collect();
        let h = harness(ScriptedProvider::new(looping), 2);
        let outcome = h
            .agent
            .run_turn("k", "telegram", "loop forever", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::Truncated);
        assert!(outcome.reply.contains("maximum number of tool iterations"));
        let hist = history(&h.agent, "k").await;
        assert_eq!(hist.last().unwrap().role, "assistant");
        assert_eq!(hist.iter().filter(|m| m.role == "tool").count(), 2);
    }

    #[tokio::test]
    async fn test_provider_failure_keeps_only_user_turn() {
        let h = harness(
            ScriptedProvider::new(vec![
                Err(Error::Provider("503".into())),
                Err(Error::Provider("503".into())),
            ]),
            8,
        );
        let outcome = h
            .agent
            .run_turn("k", "telegram", "hello", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::Failed);
        assert!(outcome.reply.contains("503"));
        let hist = history(&h.agent, "k").await;
        assert_eq!(hist.len(), 1);
        assert_eq!(hist[0].role, "user");
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let h = harness(
            ScriptedProvider::new(vec![Err(Error::Timeout("slow".into())), Ok(text("fine"))]),
            8,
        );
        let outcome = h
            .agent
            .run_turn("k", "telegram", "hello", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.reply, "fine");
        assert_eq!(h.provider.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_same_user_turns_serialize() {
        let h = harness(
            ScriptedProvider::new(vec![]).with_delay(Duration::from_millis(30)),
            8,
        );
        let mut out = h.bus.subscribe_outbound("telegram").unwrap();

        let a = {
            let agent = h.agent.clone();
            tokio::spawn(async move {
                agent
                    .dispatch(InboundMessage::new("telegram", "7", "7", "A"), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        let b = {
            let agent = h.agent.clone();
            tokio::spawn(async move {
                agent
                    .dispatch(InboundMessage::new("telegram", "7", "7", "B"), &CancellationToken::new())
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(out.recv().await.unwrap().content, "echo: A");
        assert_eq!(out.recv().await.unwrap().content, "echo: B");

        let seen = h.provider.seen.lock().unwrap();
        let second = &seen[1];
        assert!(second.iter().any(|m| m.role == "assistant" && m.text() == "echo: A"));
    }

    #[tokio::test]
    async fn test_cancel_during_llm_call() {
        let h = harness(
            ScriptedProvider::new(vec![]).with_delay(Duration::from_secs(10)),
            8,
        );
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c.cancel();
        });

        let started = std::time::Instant::now();
        let err = h.agent.run_turn("k", "telegram", "slow", &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(5));

        let hist = history(&h.agent, "k").await;
        assert_eq!(hist.len(), 1);
        assert_eq!(hist[0].role, "user");
    }

    #[test]
    fn test_user_content_mentions_attachments() {
        let mut msg = InboundMessage::new("telegram", "1", "1", "look");
        msg.attachments.push(Attachment::new("image/png", "cat.png", vec![0; 3]));
        assert_eq!(user_content(&msg), "look\n[attachment: cat.png (image/png, 3 bytes)]");
    }
}
