use crate::message::ConversationMessage;
use crate::store::SessionStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use cq_llm::{ChatRole, ChatUsage, WireMessage};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    #[serde(default)]
    pub title: Option<String>,
    pub messages: Vec<ConversationMessage>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub usage_totals: ChatUsage,
    #[serde(default)]
    pub model_override: Option<String>,
}

impl Session {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: None,
            messages: Vec::new(),
            created_at: now,
            last_active: now,
            usage_totals: ChatUsage::default(),
            model_override: None,
        }
    }

    /// Messages a human-facing renderer may display.
    pub fn visible_messages(&self) -> impl Iterator<Item = &ConversationMessage> {
        self.messages.iter().filter(|m| !m.hidden_from_view)
    }

    /// Full model context: system prompt plus every non-placeholder message,
    /// hidden tool results included.
    pub fn wire_history(&self, system_prompt: &str) -> Vec<WireMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        out.push(WireMessage::new(ChatRole::System, system_prompt));
        out.extend(self.messages.iter().filter_map(|m| m.to_wire()));
        out
    }

    /// First and only completed exchange, used to trigger title generation.
    pub fn is_first_exchange(&self) -> bool {
        self.title.is_none()
            && self
                .messages
                .iter()
                .filter(|m| !m.hidden_from_view && !m.content.is_empty())
                .count()
                <= 2
    }
}

/// In-memory session map backed by the durable store. Persistence happens
/// only at turn boundaries; mid-flight state never touches disk.
pub struct SessionManager {
    sessions: DashMap<Uuid, Session>,
    store: SessionStore,
}

impl SessionManager {
    pub fn load_or_new(store: SessionStore) -> Result<Self> {
        let sessions = DashMap::new();
        for session in store.load_all()? {
            sessions.insert(session.id, session);
        }
        Ok(Self { sessions, store })
    }

    pub fn create_session(&self) -> Uuid {
        let session = Session::new();
        let id = session.id;
        self.sessions.insert(id, session);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Run a mutation against one session inside the map lock.
    pub fn with_session_mut<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Session) -> T,
    ) -> Option<T> {
        self.sessions.get_mut(&id).map(|mut s| {
            s.last_active = Utc::now();
            f(&mut s)
        })
    }

    pub fn add_usage(&self, id: Uuid, usage: ChatUsage) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.usage_totals.prompt_tokens += usage.prompt_tokens;
            session.usage_totals.completion_tokens += usage.completion_tokens;
            session.usage_totals.total_tokens += usage.total_tokens;
        }
    }

    /// Remove a session from the live map and the store. In-flight results
    /// for it are dropped by the orchestrator's liveness checks.
    pub fn delete_session(&self, id: Uuid) -> Result<bool> {
        let removed = self.sessions.remove(&id).is_some();
        let stored = self.store.delete(id)?;
        Ok(removed || stored)
    }

    pub fn persist(&self, id: Uuid) -> Result<()> {
        if let Some(session) = self.sessions.get(&id) {
            self.store.upsert(&session)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let s = entry.value();
                SessionSummary {
                    id: s.id,
                    title: s.title.clone(),
                    created_at: s.created_at,
                    last_active: s.last_active,
                    messages: s.messages.len(),
                }
            })
            .collect();
        out.sort_by_key(|s| s.last_active);
        out.reverse();
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub messages: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::load_or_new(SessionStore::in_memory().unwrap()).unwrap()
    }

    #[test]
    fn hidden_messages_are_excluded_from_visible_view() {
        let m = manager();
        let id = m.create_session();
        m.with_session_mut(id, |s| {
            s.messages.push(ConversationMessage::user("list files"));
            s.messages.push(ConversationMessage::hidden_tool_result(
                "Running command: ls",
                "a.txt",
            ));
        });
        let session = m.get(id).unwrap();
        assert_eq!(session.visible_messages().count(), 1);
        // model context includes system prompt + user + hidden result
        assert_eq!(session.wire_history("sys").len(), 3);
    }

    #[test]
    fn usage_accumulates() {
        let m = manager();
        let id = m.create_session();
        let usage = ChatUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        };
        m.add_usage(id, usage);
        m.add_usage(id, usage);
        let session = m.get(id).unwrap();
        assert_eq!(session.usage_totals.total_tokens, 30);
    }

    #[test]
    fn first_exchange_detection() {
        let m = manager();
        let id = m.create_session();
        m.with_session_mut(id, |s| {
            s.messages.push(ConversationMessage::user("hi"));
            let mut reply = ConversationMessage::assistant_placeholder();
            reply.is_thinking = false;
            reply.content = "hello".to_string();
            s.messages.push(reply);
        });
        assert!(m.get(id).unwrap().is_first_exchange());

        m.with_session_mut(id, |s| {
            s.messages.push(ConversationMessage::user("more"));
            s.title = Some("greeting".to_string());
        });
        assert!(!m.get(id).unwrap().is_first_exchange());
    }

    #[test]
    fn deleted_sessions_are_gone_from_map_and_store() {
        let m = manager();
        let id = m.create_session();
        m.persist(id).unwrap();
        assert!(m.delete_session(id).unwrap());
        assert!(!m.contains(id));
        assert!(!m.delete_session(id).unwrap());
    }

    #[test]
    fn persists_and_reloads_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db3");
        let id = {
            let m = SessionManager::load_or_new(SessionStore::open(&path).unwrap()).unwrap();
            let id = m.create_session();
            m.with_session_mut(id, |s| {
                s.messages.push(ConversationMessage::user("hello"));
            });
            m.persist(id).unwrap();
            id
        };

        let reloaded = SessionManager::load_or_new(SessionStore::open(&path).unwrap()).unwrap();
        let session = reloaded.get(id).expect("session survives restart");
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].content, "hello");
    }
}
