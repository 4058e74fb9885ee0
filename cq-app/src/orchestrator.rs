//! Turn orchestrator: drives one user message through the model, executes
//! tool calls the model requests, and writes the results back into the
//! session. One request is in flight at a time; a newer request supersedes
//! the old one, whose late results are discarded.

use crate::message::ConversationMessage;
use crate::routing::ModelRouter;
use crate::session::SessionManager;
use anyhow::Result;
use cq_llm::{ChatClient, ChatRole, HttpErrorKind, LlmError, WireMessage};
use cq_tools::{parse_tool_call, should_show_output, ToolAction, ToolExecutor};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use uuid::Uuid;

const TITLE_PROMPT: &str = "Generate a short title (at most six words) summarizing this \
conversation. Reply with the title only, no quotes or punctuation around it.";

/// Identity of one in-flight model request. Passed by value through the
/// turn loop; a result is applied only when the context's `request_id`
/// still equals the orchestrator's outstanding id. That equality check is
/// the sole cancellation mechanism.
#[derive(Debug, Clone)]
struct RequestContext {
    request_id: Uuid,
    session_id: Uuid,
    model: String,
    started_at: Instant,
}

/// Result of one full turn.
#[derive(Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The assistant reply shown to the user.
    Completed(String),
    /// A newer request or a cancellation made this turn's results stale;
    /// nothing further was written to the session.
    Superseded,
}

pub struct Orchestrator {
    client: Arc<ChatClient>,
    executor: Arc<ToolExecutor>,
    sessions: Arc<SessionManager>,
    router: ModelRouter,
    system_prompt: String,
    max_tool_turns: usize,
    outstanding: Mutex<Option<Uuid>>,
    status_tx: watch::Sender<String>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<ChatClient>,
        executor: Arc<ToolExecutor>,
        sessions: Arc<SessionManager>,
        router: ModelRouter,
        system_prompt: String,
        max_tool_turns: usize,
    ) -> Self {
        let (status_tx, _) = watch::channel(String::new());
        Self {
            client,
            executor,
            sessions,
            router,
            system_prompt,
            max_tool_turns,
            outstanding: Mutex::new(None),
            status_tx,
        }
    }

    /// Progress lines ("Running command: ...") for a UI to render while a
    /// turn is in flight. An empty string means idle.
    pub fn status(&self) -> watch::Receiver<String> {
        self.status_tx.subscribe()
    }

    /// Drop the in-flight request, if any, and roll back its placeholder.
    /// The awaited model call is not interrupted; its result is discarded
    /// when it lands because the request id no longer matches.
    pub fn cancel(&self, session_id: Uuid) {
        let had_request = self.lock_outstanding().take().is_some();
        if !had_request {
            return;
        }
        let rolled_back = self
            .sessions
            .with_session_mut(session_id, rollback_placeholder)
            .unwrap_or(false);
        if rolled_back {
            if let Err(e) = self.sessions.persist(session_id) {
                tracing::warn!(session_id = %session_id, error = %e, "persist after cancel failed");
            }
        }
        self.set_status(String::new());
        tracing::info!(session_id = %session_id, rolled_back, "turn cancelled");
    }

    #[tracing::instrument(level = "info", skip_all, fields(session_id = %session_id))]
    pub async fn run_turn(
        &self,
        session_id: Uuid,
        user_text: &str,
        image: Option<Vec<u8>>,
    ) -> Result<TurnOutcome> {
        let has_image = image.is_some();
        let appended = self.sessions.with_session_mut(session_id, |s| {
            let mut user = ConversationMessage::user(user_text);
            user.image_attachment = image;
            s.messages.push(user);
            s.messages.push(ConversationMessage::assistant_placeholder());
        });
        if appended.is_none() {
            anyhow::bail!("unknown session: {session_id}");
        }
        // not persisted yet: the store only sees turn boundaries, so a crash
        // here cannot freeze an in-flight placeholder on disk

        let override_model = self
            .sessions
            .get(session_id)
            .and_then(|s| s.model_override);
        let model = self
            .router
            .resolve(user_text, override_model.as_deref(), has_image);
        let mut ctx = self.begin_request(session_id, model);
        tracing::info!(
            request_id = %ctx.request_id,
            model = %ctx.model,
            content_len = user_text.len(),
            has_image,
            "turn started"
        );

        let mut tool_turns = 0usize;
        loop {
            self.sessions.with_session_mut(ctx.session_id, |s| {
                if let Some(placeholder) = s.messages.iter_mut().rev().find(|m| m.is_thinking) {
                    if !placeholder.models_attempted.contains(&ctx.model) {
                        placeholder.models_attempted.push(ctx.model.clone());
                    }
                }
            });
            let Some(history) = self
                .sessions
                .get(ctx.session_id)
                .map(|s| s.wire_history(&self.system_prompt))
            else {
                self.finish_request(&ctx);
                return Ok(TurnOutcome::Superseded);
            };

            self.set_status(format!("Thinking ({})...", ctx.model));
            let llm_started = Instant::now();
            let result = self.client.chat_completion(&history, &ctx.model).await;
            if !self.is_current(&ctx) {
                tracing::info!(request_id = %ctx.request_id, "stale model response discarded");
                return Ok(TurnOutcome::Superseded);
            }

            let completion = match result {
                Ok(completion) => completion,
                Err(err) => {
                    if err.http_kind() == Some(HttpErrorKind::ModelNotFound) {
                        let attempted = self.attempted_models(ctx.session_id);
                        if let Some(next) = self.router.next_fallback(&attempted) {
                            tracing::warn!(
                                model = %ctx.model,
                                fallback = %next,
                                "model unavailable, trying fallback"
                            );
                            ctx = match self.renew_request(ctx) {
                                Some(renewed) => renewed,
                                None => return Ok(TurnOutcome::Superseded),
                            };
                            ctx.model = next;
                            continue;
                        }
                    }
                    tracing::error!(model = %ctx.model, error = %err, "model call failed");
                    let reply = error_reply(&err, &ctx.model);
                    return self.finish_turn(&ctx, reply);
                }
            };
            tracing::info!(
                model = %ctx.model,
                latency_ms = llm_started.elapsed().as_millis() as u64,
                prompt_tokens = completion.usage.prompt_tokens,
                completion_tokens = completion.usage.completion_tokens,
                content_len = completion.content.len(),
                "model call completed"
            );
            // usage mutates shared counters only while the session is live
            if !self.sessions.contains(ctx.session_id) {
                self.finish_request(&ctx);
                return Ok(TurnOutcome::Superseded);
            }
            self.sessions.add_usage(ctx.session_id, completion.usage);

            let Some(action) = parse_tool_call(&completion.content) else {
                return self.finish_turn(&ctx, completion.content);
            };

            tool_turns += 1;
            if tool_turns > self.max_tool_turns {
                tracing::error!(max_tool_turns = self.max_tool_turns, "tool turn limit reached");
                let reply = format!(
                    "Stopped after {} consecutive tool calls without a final answer.",
                    self.max_tool_turns
                );
                return self.finish_turn(&ctx, reply);
            }

            let description = action.describe();
            self.set_status(description.clone());
            let tool_started = Instant::now();
            let output = self.executor.execute(&action).await;
            tracing::info!(
                description = %description,
                latency_ms = tool_started.elapsed().as_millis() as u64,
                output_len = output.len(),
                "tool executed"
            );
            if !self.is_current(&ctx) {
                tracing::info!(request_id = %ctx.request_id, "stale tool result discarded");
                return Ok(TurnOutcome::Superseded);
            }

            let show = should_show_output(&action, &output);
            if self
                .sessions
                .with_session_mut(ctx.session_id, |s| {
                    record_tool_turn(s, &action, &output, show, &ctx.model)
                })
                .is_none()
            {
                self.finish_request(&ctx);
                return Ok(TurnOutcome::Superseded);
            }
            self.sessions.persist(ctx.session_id)?;

            // same model, fresh request identity for the next round trip
            ctx = match self.renew_request(ctx) {
                Some(renewed) => renewed,
                None => return Ok(TurnOutcome::Superseded),
            };
        }
    }

    fn finish_turn(&self, ctx: &RequestContext, reply: String) -> Result<TurnOutcome> {
        let first_exchange = self
            .sessions
            .with_session_mut(ctx.session_id, |s| {
                finalize_assistant(s, &reply, &ctx.model);
                s.is_first_exchange()
            })
            .unwrap_or(false);
        self.sessions.persist(ctx.session_id)?;
        self.finish_request(ctx);
        self.set_status(String::new());
        tracing::info!(
            request_id = %ctx.request_id,
            latency_ms = ctx.started_at.elapsed().as_millis() as u64,
            reply_len = reply.len(),
            "turn completed"
        );
        if first_exchange {
            self.spawn_title_task(ctx.session_id);
        }
        Ok(TurnOutcome::Completed(reply))
    }

    /// Title generation runs detached; a failure only leaves the session
    /// untitled.
    fn spawn_title_task(&self, session_id: Uuid) {
        let client = Arc::clone(&self.client);
        let sessions = Arc::clone(&self.sessions);
        let model = self.router.default_model().to_string();
        tracing::debug!(session_id = %session_id, "title generation scheduled");
        tokio::spawn(async move {
            let Some(session) = sessions.get(session_id) else {
                return;
            };
            let Some(first_user) = session
                .visible_messages()
                .find(|m| !m.content.is_empty())
                .map(|m| m.content.clone())
            else {
                return;
            };
            let messages = vec![
                WireMessage::new(ChatRole::System, TITLE_PROMPT),
                WireMessage::new(ChatRole::User, first_user),
            ];
            match client.chat_completion(&messages, &model).await {
                Ok(completion) => {
                    let title = clip_title(&completion.content);
                    if title.is_empty() {
                        return;
                    }
                    sessions.with_session_mut(session_id, |s| {
                        if s.title.is_none() {
                            s.title = Some(title);
                        }
                    });
                    if let Err(e) = sessions.persist(session_id) {
                        tracing::warn!(session_id = %session_id, error = %e, "title persist failed");
                    }
                }
                Err(e) => {
                    tracing::debug!(session_id = %session_id, error = %e, "title generation failed");
                }
            }
        });
    }

    fn attempted_models(&self, session_id: Uuid) -> Vec<String> {
        self.sessions
            .get(session_id)
            .and_then(|s| {
                s.messages
                    .iter()
                    .rev()
                    .find(|m| m.is_thinking)
                    .map(|m| m.models_attempted.clone())
            })
            .unwrap_or_default()
    }

    fn begin_request(&self, session_id: Uuid, model: String) -> RequestContext {
        let ctx = RequestContext {
            request_id: Uuid::new_v4(),
            session_id,
            model,
            started_at: Instant::now(),
        };
        *self.lock_outstanding() = Some(ctx.request_id);
        ctx
    }

    /// Rotate the request identity between attempts. Fails if the turn was
    /// cancelled or superseded while the previous id was in flight.
    fn renew_request(&self, ctx: RequestContext) -> Option<RequestContext> {
        let mut guard = self.lock_outstanding();
        if *guard != Some(ctx.request_id) {
            return None;
        }
        let renewed = RequestContext {
            request_id: Uuid::new_v4(),
            ..ctx
        };
        *guard = Some(renewed.request_id);
        Some(renewed)
    }

    fn finish_request(&self, ctx: &RequestContext) {
        let mut guard = self.lock_outstanding();
        if *guard == Some(ctx.request_id) {
            *guard = None;
        }
    }

    fn is_current(&self, ctx: &RequestContext) -> bool {
        *self.lock_outstanding() == Some(ctx.request_id)
    }

    fn lock_outstanding(&self) -> std::sync::MutexGuard<'_, Option<Uuid>> {
        self.outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: String) {
        let _ = self.status_tx.send(status);
    }
}

/// Turn the trailing placeholder into the final assistant message.
fn finalize_assistant(session: &mut crate::session::Session, content: &str, model: &str) {
    if let Some(placeholder) = session.messages.iter_mut().rev().find(|m| m.is_thinking) {
        placeholder.is_thinking = false;
        placeholder.content = content.to_string();
        placeholder.used_model = Some(model.to_string());
    }
}

/// Write one tool execution into the session: the placeholder becomes the
/// visible progress line, a hidden result message carries the output back
/// to the model, and a fresh placeholder awaits the next reply.
fn record_tool_turn(
    session: &mut crate::session::Session,
    action: &ToolAction,
    output: &str,
    show_output: bool,
    model: &str,
) {
    let description = action.describe();
    if let Some(placeholder) = session.messages.iter_mut().rev().find(|m| m.is_thinking) {
        placeholder.is_thinking = false;
        placeholder.content = description.clone();
        placeholder.tool_description = Some(description.clone());
        placeholder.used_model = Some(model.to_string());
        if show_output {
            placeholder.tool_output = Some(output.to_string());
        }
    }
    session
        .messages
        .push(ConversationMessage::hidden_tool_result(&description, output));
    session
        .messages
        .push(ConversationMessage::assistant_placeholder());
}

/// Remove the trailing in-flight placeholder after a cancellation.
fn rollback_placeholder(session: &mut crate::session::Session) -> bool {
    match session.messages.last() {
        Some(m) if m.is_thinking => {
            session.messages.pop();
            true
        }
        _ => false,
    }
}

fn error_reply(err: &LlmError, model: &str) -> String {
    match err.http_kind() {
        Some(HttpErrorKind::Auth) => {
            "Authentication failed. Check your API key configuration.".to_string()
        }
        Some(HttpErrorKind::RateLimit) => {
            "The provider is rate limiting requests. Please try again shortly.".to_string()
        }
        Some(HttpErrorKind::Server) => {
            "The provider returned a server error. Please try again.".to_string()
        }
        Some(HttpErrorKind::ModelNotFound) => {
            format!("Model '{model}' is not available and no fallback model succeeded.")
        }
        Some(HttpErrorKind::Other) => format!("The request failed: {err}"),
        None => match err {
            LlmError::Network(detail) => {
                format!("Could not reach the model provider: {detail}")
            }
            other => format!("The request failed: {other}"),
        },
    }
}

fn clip_title(raw: &str) -> String {
    let cleaned = raw.trim().trim_matches('"').trim();
    let mut title: String = cleaned.chars().take(60).collect();
    if cleaned.chars().count() > 60 {
        title.push_str("...");
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStore;

    fn manager() -> SessionManager {
        SessionManager::load_or_new(SessionStore::in_memory().unwrap()).unwrap()
    }

    fn seed_turn(m: &SessionManager) -> Uuid {
        let id = m.create_session();
        m.with_session_mut(id, |s| {
            s.messages.push(ConversationMessage::user("list the files"));
            s.messages.push(ConversationMessage::assistant_placeholder());
        });
        id
    }

    fn orchestrator() -> Orchestrator {
        let client = Arc::new(ChatClient::new(
            "http://127.0.0.1:1",
            "test-key",
            cq_llm::RetryPolicy::default(),
        ));
        let executor = Arc::new(ToolExecutor::new(
            std::env::temp_dir(),
            true,
            cq_tools::ExecutorLimits::default(),
        ));
        let sessions = Arc::new(manager());
        let router = ModelRouter::new(
            "gpt-4o".to_string(),
            None,
            None,
            None,
            vec!["gpt-4o-mini".to_string()],
        );
        Orchestrator::new(
            client,
            executor,
            sessions,
            router,
            "system".to_string(),
            25,
        )
    }

    #[test]
    fn finalize_fills_the_trailing_placeholder() {
        let m = manager();
        let id = seed_turn(&m);
        m.with_session_mut(id, |s| finalize_assistant(s, "done", "gpt-4o"));
        let session = m.get(id).unwrap();
        let last = session.messages.last().unwrap();
        assert!(!last.is_thinking);
        assert_eq!(last.content, "done");
        assert_eq!(last.used_model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn tool_turn_appends_hidden_result_and_new_placeholder() {
        let m = manager();
        let id = seed_turn(&m);
        let action = ToolAction::Terminal {
            command: "ls".to_string(),
        };
        m.with_session_mut(id, |s| {
            record_tool_turn(s, &action, "a.txt\nb.txt", false, "gpt-4o")
        });

        let session = m.get(id).unwrap();
        assert_eq!(session.messages.len(), 4);
        let progress = &session.messages[1];
        assert!(!progress.is_thinking);
        assert_eq!(progress.content, "Running command: ls");
        assert!(progress.tool_output.is_none());
        let hidden = &session.messages[2];
        assert!(hidden.hidden_from_view);
        assert!(hidden.content.contains("a.txt"));
        assert!(session.messages[3].is_thinking);
    }

    #[test]
    fn tool_turn_surfaces_output_when_visible() {
        let m = manager();
        let id = seed_turn(&m);
        let action = ToolAction::Terminal {
            command: "cargo test".to_string(),
        };
        m.with_session_mut(id, |s| {
            record_tool_turn(s, &action, "test result: ok", true, "gpt-4o")
        });
        let session = m.get(id).unwrap();
        assert_eq!(
            session.messages[1].tool_output.as_deref(),
            Some("test result: ok")
        );
    }

    #[test]
    fn rollback_removes_only_a_trailing_placeholder() {
        let m = manager();
        let id = seed_turn(&m);
        assert!(m.with_session_mut(id, rollback_placeholder).unwrap());
        let session = m.get(id).unwrap();
        assert_eq!(session.messages.len(), 1);

        // nothing in flight: rollback is a no-op
        assert!(!m.with_session_mut(id, rollback_placeholder).unwrap());
        assert_eq!(m.get(id).unwrap().messages.len(), 1);
    }

    #[test]
    fn stale_context_cannot_be_renewed() {
        let orch = orchestrator();
        let session_id = seed_turn(&orch.sessions);
        let first = orch.begin_request(session_id, "gpt-4o".to_string());
        let second = orch.begin_request(session_id, "gpt-4o".to_string());
        assert!(orch.renew_request(first.clone()).is_none());
        assert!(!orch.is_current(&first));
        assert!(orch.is_current(&second));

        let third = orch.renew_request(second.clone()).unwrap();
        assert!(!orch.is_current(&second));
        assert!(orch.is_current(&third));
        assert_eq!(third.session_id, session_id);
    }

    #[test]
    fn cancel_clears_request_and_rolls_back_placeholder() {
        let orch = orchestrator();
        let session_id = seed_turn(&orch.sessions);
        let ctx = orch.begin_request(session_id, "gpt-4o".to_string());
        orch.cancel(session_id);
        assert!(!orch.is_current(&ctx));
        let session = orch.sessions.get(session_id).unwrap();
        assert_eq!(session.messages.len(), 1);
    }

    #[test]
    fn error_replies_are_user_facing() {
        let auth = LlmError::Http {
            status: 401,
            body: String::new(),
        };
        assert!(error_reply(&auth, "gpt-4o").contains("API key"));

        let network = LlmError::Network("connection refused".to_string());
        assert!(error_reply(&network, "gpt-4o").contains("connection refused"));

        let missing = LlmError::Http {
            status: 400,
            body: "model does not exist".to_string(),
        };
        assert!(error_reply(&missing, "gpt-4o").contains("gpt-4o"));
    }

    #[test]
    fn titles_are_trimmed_and_clipped() {
        assert_eq!(clip_title("  \"Fix the build\"  "), "Fix the build");
        let long = "x".repeat(100);
        let clipped = clip_title(&long);
        assert!(clipped.ends_with("..."));
        assert_eq!(clipped.chars().count(), 63);
    }
}
