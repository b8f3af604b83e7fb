//! In-memory chat session store.
//!
//! Sessions are identified by a client-generated id and owned by the logged-in
//! user (or by nobody when auth is disabled). Two sessions with the same id but
//! different owners are distinct. History is lost on restart.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::SessionsConfig;
use crate::models::{ChatMessage, Role, SessionSummary};
use crate::webhook::HistoryEntry;

const TITLE_MAX_CHARS: usize = 60;
const SESSION_ID_MAX_LEN: usize = 128;

type SessionKey = (Option<String>, String);

#[derive(Debug, Clone)]
struct Session {
    title: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    messages: Vec<ChatMessage>,
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<SessionKey, Session>>>,
    max_sessions: usize,
    max_messages: usize,
}

/// Returns true if `id` is 1–128 characters of `[A-Za-z0-9_-]`.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= SESSION_ID_MAX_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

impl SessionStore {
    pub fn new(config: &SessionsConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            max_sessions: config.max_sessions,
            max_messages: config.max_messages,
        }
    }

    /// Appends a message, creating the session on first use.
    pub async fn append(&self, owner: Option<&str>, message: ChatMessage) {
        let key = (owner.map(str::to_string), message.session_id.clone());
        let mut sessions = self.inner.write().await;

        if !sessions.contains_key(&key) && sessions.len() >= self.max_sessions {
            evict_oldest(&mut sessions);
        }

        let now = message.created_at;
        let session = sessions.entry(key).or_insert_with(|| Session {
            title: String::new(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        });

        if session.title.is_empty() && message.role == Role::User {
            session.title = make_title(&message.content);
        }
        session.updated_at = now;
        session.messages.push(message);

        if session.messages.len() > self.max_messages {
            let excess = session.messages.len() - self.max_messages;
            session.messages.drain(..excess);
        }
    }

    /// Full history of a session, oldest first. `None` if it does not exist.
    pub async fn history(&self, owner: Option<&str>, session_id: &str) -> Option<Vec<ChatMessage>> {
        let sessions = self.inner.read().await;
        sessions
            .get(&(owner.map(str::to_string), session_id.to_string()))
            .map(|s| s.messages.clone())
    }

    /// The last `window` messages, in the form forwarded to the webhook.
    pub async fn recent(&self, owner: Option<&str>, session_id: &str, window: usize) -> Vec<HistoryEntry> {
        let sessions = self.inner.read().await;
        let Some(session) = sessions.get(&(owner.map(str::to_string), session_id.to_string()))
        else {
            return Vec::new();
        };
        let start = session.messages.len().saturating_sub(window);
        session.messages[start..]
            .iter()
            .map(|m| HistoryEntry {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }

    /// Sessions of one owner, most recently updated first.
    pub async fn list(&self, owner: Option<&str>) -> Vec<SessionSummary> {
        let sessions = self.inner.read().await;
        let mut out: Vec<SessionSummary> = sessions
            .iter()
            .filter(|((o, _), _)| o.as_deref() == owner)
            .map(|((_, id), s)| SessionSummary {
                id: id.clone(),
                title: if s.title.is_empty() {
                    "New chat".to_string()
                } else {
                    s.title.clone()
                },
                message_count: s.messages.len(),
                created_at: s.created_at,
                updated_at: s.updated_at,
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Removes a session. Returns false if it did not exist.
    pub async fn delete(&self, owner: Option<&str>, session_id: &str) -> bool {
        let mut sessions = self.inner.write().await;
        sessions
            .remove(&(owner.map(str::to_string), session_id.to_string()))
            .is_some()
    }

    /// Removes every session of an owner and returns how many were removed.
    pub async fn clear_owner(&self, owner: Option<&str>) -> usize {
        let mut sessions = self.inner.write().await;
        let before = sessions.len();
        sessions.retain(|(o, _), _| o.as_deref() != owner);
        before - sessions.len()
    }
}

fn evict_oldest(sessions: &mut HashMap<SessionKey, Session>) {
    let oldest = sessions
        .iter()
        .min_by_key(|(_, s)| s.updated_at)
        .map(|(k, _)| k.clone());
    if let Some(key) = oldest {
        tracing::debug!(session = %key.1, "evicting least recently used session");
        sessions.remove(&key);
    }
}

fn make_title(content: &str) -> String {
    let line = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }
    let mut title: String = line.chars().take(TITLE_MAX_CHARS - 1).collect();
    title.push('…');
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Answer;
    use chrono::Duration;

    fn store(max_sessions: usize, max_messages: usize) -> SessionStore {
        SessionStore::new(&SessionsConfig {
            max_sessions,
            max_messages,
        })
    }

    fn at(msg: ChatMessage, secs: i64) -> ChatMessage {
        ChatMessage {
            created_at: DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
            ..msg
        }
    }

    #[test]
    fn session_id_validation() {
        assert!(is_valid_session_id("abc-123_X"));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("../etc"));
        assert!(!is_valid_session_id(&"a".repeat(129)));
    }

    #[test]
    fn titles_are_truncated() {
        assert_eq!(make_title("\n  Hello there \nsecond"), "Hello there");
        let long = "x".repeat(100);
        let title = make_title(&long);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS);
        assert!(title.ends_with('…'));
    }

    #[tokio::test]
    async fn append_and_history() {
        let store = store(10, 10);
        store.append(None, ChatMessage::user("s1", "What is the leave policy?")).await;
        store
            .append(
                None,
                ChatMessage::assistant(
                    "s1",
                    Answer {
                        text: "20 days.".into(),
                        ..Answer::default()
                    },
                ),
            )
            .await;

        let history = store.history(None, "s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);
        assert!(store.history(None, "missing").await.is_none());

        let list = store.list(None).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].title, "What is the leave policy?");
        assert_eq!(list[0].message_count, 2);
    }

    #[tokio::test]
    async fn owners_are_isolated() {
        let store = store(10, 10);
        store.append(Some("ana"), ChatMessage::user("s1", "mine")).await;
        store.append(Some("ben"), ChatMessage::user("s1", "also mine")).await;

        assert_eq!(store.list(Some("ana")).await.len(), 1);
        assert_eq!(store.list(None).await.len(), 0);
        assert_eq!(
            store.history(Some("ben"), "s1").await.unwrap()[0].content,
            "also mine"
        );
        assert!(store.delete(Some("ana"), "s1").await);
        assert!(!store.delete(Some("ana"), "s1").await);
        assert_eq!(store.clear_owner(Some("ana")).await, 0);
        assert_eq!(store.clear_owner(Some("ben")).await, 1);
    }

    #[tokio::test]
    async fn message_cap_drops_oldest() {
        let store = store(10, 3);
        for i in 0..5 {
            store.append(None, ChatMessage::user("s", &format!("m{}", i))).await;
        }
        let history = store.history(None, "s").await.unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
        // The title survives trimming.
        assert_eq!(store.list(None).await[0].title, "m0");
    }

    #[tokio::test]
    async fn session_cap_evicts_least_recently_updated() {
        let store = store(2, 10);
        store.append(None, at(ChatMessage::user("a", "first"), 0)).await;
        store.append(None, at(ChatMessage::user("b", "second"), 10)).await;
        store.append(None, at(ChatMessage::user("a", "touch"), 20)).await;
        store.append(None, at(ChatMessage::user("c", "third"), 30)).await;

        let ids: Vec<_> = store.list(None).await.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn recent_window() {
        let store = store(10, 10);
        for i in 0..4 {
            let msg = at(ChatMessage::user("s", &format!("m{}", i)), i);
            store.append(None, msg).await;
        }
        let recent = store.recent(None, "s", 2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "m2");
        assert!(store.recent(None, "none", 2).await.is_empty());

        let list = store.list(None).await;
        assert!(list[0].updated_at - list[0].created_at == Duration::seconds(3));
    }
}
