use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::AppResult;
use crate::events::{self, UnsubscribeScope};
use crate::locks::{self, UnlockCriteria};
use crate::pipeline::Engine;

/// Per-node map from session id to its SSE sink, plus the event keys each
/// session has taken locks under.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<String, mpsc::Sender<Value>>>>,
    event_keys: Arc<Mutex<HashMap<String, HashSet<String>>>>,
}

impl SessionRegistry {
    pub fn register(&self, session_id: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(64);
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.to_string(), tx);
        rx
    }

    pub fn remove(&self, session_id: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }

    /// Deliver a payload; a full or closed sink disconnects the session.
    pub fn send(&self, session_id: &str, payload: Value) -> bool {
        let sender = {
            let sessions = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            sessions.get(session_id).cloned()
        };
        match sender {
            Some(sender) => {
                if sender.try_send(payload).is_err() {
                    self.remove(session_id);
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(session_id)
    }

    /// Remember that a session holds locks under an event key, so closing
    /// the session can release them.
    pub fn track_event_key(&self, session_id: &str, event_key: &str) {
        self.event_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id.to_string())
            .or_default()
            .insert(event_key.to_string());
    }

    pub fn take_event_keys(&self, session_id: &str) -> Vec<String> {
        self.event_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub sessions: SessionRegistry,
    pub node_id: String,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, node_id: impl Into<String>) -> Self {
        let state = AppState {
            engine,
            sessions: SessionRegistry::default(),
            node_id: node_id.into(),
        };
        state.spawn_node_pump();
        state
    }

    /// One long-lived listener per node drains the bus into the session
    /// sinks; a session that cannot keep up is dropped and cleaned out.
    fn spawn_node_pump(&self) {
        let mut rx = self.engine.bus.listen(&self.node_id);
        let sessions = self.sessions.clone();
        let engine = self.engine.clone();
        let node_id = self.node_id.clone();
        tokio::spawn(async move {
            loop {
                let payload = match rx.recv().await {
                    Ok(payload) => payload,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(
                            target = "plume",
                            event = "node_pump_lagged",
                            node = %node_id,
                            missed
                        );
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let session_id = payload
                    .pointer("/message/subscription/sessionId")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if session_id.is_empty() {
                    continue;
                }
                if !sessions.send(&session_id, payload) {
                    let event_keys = sessions.take_event_keys(&session_id);
                    if let Err(err) = close_session(&engine, &session_id, &event_keys).await {
                        warn!(
                            target = "plume",
                            event = "session_cleanup_failed",
                            session = %session_id,
                            error = %err
                        );
                    }
                }
            }
        });
    }
}

/// A closed session drops its subscriptions, and every lock taken under its
/// event keys is released.
pub async fn close_session(
    engine: &Engine,
    session_id: &str,
    event_keys: &[String],
) -> AppResult<()> {
    let mut conn = engine.pool.acquire().await.map_err(crate::AppError::from)?;
    events::unsubscribe(&mut *conn, session_id, UnsubscribeScope::Session).await?;
    for event_key in event_keys {
        locks::unlock(
            &mut *conn,
            &UnlockCriteria {
                event_key: Some(event_key.clone()),
                ..UnlockCriteria::default()
            },
        )
        .await?;
    }
    info!(target = "plume", event = "session_closed", session = %session_id);
    Ok(())
}
