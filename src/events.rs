use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{Row, SqliteConnection};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::tools::sanitize;

/// Interest in change notifications, keyed by node, session and
/// subscription id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub session_id: String,
    pub node_id: String,
    #[serde(default)]
    pub merge: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnsubscribeScope {
    Subscription,
    Session,
    Node,
}

/// A committed change waiting to fan out.
#[derive(Debug, Clone)]
pub struct Change {
    pub id: String,
    pub feather: String,
    pub action: &'static str,
    pub data: Value,
}

/// Per-node listener channels. SQLite has no notification wire, so the bus
/// is the per-node channel: exactly one sender per node, any number of
/// receivers draining into per-session sinks.
#[derive(Default)]
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Open (or join) the node's listener channel.
    pub fn listen(&self, node_id: &str) -> broadcast::Receiver<Value> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(node_id.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    pub fn publish(&self, node_id: &str, payload: Value) {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = channels.get(node_id) {
            // A send only fails when every receiver is gone; nothing to do.
            let _ = sender.send(payload);
        }
    }
}

/// Record interest in object ids and optionally a feather name, so inserts
/// with no pre-existing id still notify. Without `merge`, prior rows for the
/// subscription are replaced.
pub async fn subscribe(
    conn: &mut SqliteConnection,
    subscription: &Subscription,
    ids: &[String],
    feather: Option<&str>,
) -> AppResult<()> {
    if subscription.id.is_empty()
        || subscription.session_id.is_empty()
        || subscription.node_id.is_empty()
    {
        return Err(AppError::validation(
            "Subscription requires id, sessionId and nodeId",
        ));
    }

    if !subscription.merge {
        sqlx::query(
            "DELETE FROM _subscription WHERE node_id = ? AND session_id = ? \
             AND subscription_id = ?",
        )
        .bind(&subscription.node_id)
        .bind(&subscription.session_id)
        .bind(&subscription.id)
        .execute(&mut *conn)
        .await
        .map_err(AppError::from)?;
    }

    let mut targets: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
    if let Some(feather) = feather {
        targets.push(feather);
    }
    for target in targets {
        sqlx::query(
            "INSERT INTO _subscription (node_id, session_id, subscription_id, target) \
             VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(&subscription.node_id)
        .bind(&subscription.session_id)
        .bind(&subscription.id)
        .bind(target)
        .execute(&mut *conn)
        .await
        .map_err(AppError::from)?;
    }
    Ok(())
}

/// Delete subscription rows at the requested granularity. An empty id
/// resolves without error.
pub async fn unsubscribe(
    conn: &mut SqliteConnection,
    id: &str,
    scope: UnsubscribeScope,
) -> AppResult<()> {
    if id.is_empty() {
        return Ok(());
    }
    let sql = match scope {
        UnsubscribeScope::Subscription => "DELETE FROM _subscription WHERE subscription_id = ?",
        UnsubscribeScope::Session => "DELETE FROM _subscription WHERE session_id = ?",
        UnsubscribeScope::Node => "DELETE FROM _subscription WHERE node_id = ?",
    };
    sqlx::query(sql)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

/// Fan a committed change out to every node holding a matching subscription
/// row. Feather-level matches adopt the object id so later updates stream
/// without a re-query.
pub async fn notify(
    conn: &mut SqliteConnection,
    bus: &EventBus,
    changes: &[Change],
) -> AppResult<()> {
    for change in changes {
        let rows = sqlx::query(
            "SELECT node_id, session_id, subscription_id, target FROM _subscription \
             WHERE target IN (?, ?)",
        )
        .bind(&change.id)
        .bind(&change.feather)
        .fetch_all(&mut *conn)
        .await
        .map_err(AppError::from)?;

        for row in rows {
            let node_id: String = row.get("node_id");
            let session_id: String = row.get("session_id");
            let subscription_id: String = row.get("subscription_id");
            let target: String = row.get("target");

            if target == change.feather && change.action == "create" {
                sqlx::query(
                    "INSERT INTO _subscription (node_id, session_id, subscription_id, target) \
                     VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
                )
                .bind(&node_id)
                .bind(&session_id)
                .bind(&subscription_id)
                .bind(&change.id)
                .execute(&mut *conn)
                .await
                .map_err(AppError::from)?;
            }

            let payload = json!({
                "message": {
                    "subscription": {
                        "id": subscription_id,
                        "sessionId": session_id,
                        "nodeId": node_id,
                    },
                    "action": change.action,
                    "data": sanitize(&change.data),
                }
            });
            debug!(
                target = "plume",
                event = "notify",
                node = %node_id,
                action = change.action,
                object = %change.id
            );
            bus.publish(&node_id, payload);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_delivers_to_node_listeners() {
        let bus = EventBus::new();
        let mut rx = bus.listen("node-1");
        bus.publish("node-1", json!({"n": 1}));
        bus.publish("node-2", json!({"n": 2}));
        let got = rx.recv().await.expect("payload");
        assert_eq!(got, json!({"n": 1}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn listen_is_per_node() {
        let bus = EventBus::new();
        let mut a = bus.listen("a");
        let mut b = bus.listen("a");
        bus.publish("a", json!(1));
        assert_eq!(a.recv().await.unwrap(), json!(1));
        assert_eq!(b.recv().await.unwrap(), json!(1));
    }
}
