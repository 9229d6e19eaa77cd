use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{error, info};

use crate::auth;
use crate::crud::{self, CrudContext, CrudPayload};
use crate::error::{AppError, AppResult};
use crate::events::{self, EventBus, Subscription, UnsubscribeScope};
use crate::feathers::Catalog;
use crate::locks;
use crate::tools::{self, Filter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
    Put,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Put => "PUT",
        };
        f.write_str(name)
    }
}

impl FromStr for Method {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "PUT" => Ok(Method::Put),
            other => Err(AppError::validation(format!("Invalid method: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerPosition {
    Before,
    After,
}

/// The single entry point payload. `name` is a PascalCase feather for CRUD
/// or a camelCase registered function.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Request {
    pub method: Method,
    pub name: String,
    pub id: Option<String>,
    pub user: String,
    pub data: Value,
    pub filter: Option<Filter>,
    pub subscription: Option<Subscription>,
    pub event_key: Option<String>,
    pub show_deleted: bool,
    pub is_hard: bool,
}

impl Default for Request {
    fn default() -> Self {
        Request {
            method: Method::Get,
            name: String::new(),
            id: None,
            user: "admin".to_string(),
            data: Value::Null,
            filter: None,
            subscription: None,
            event_key: None,
            show_deleted: false,
            is_hard: false,
        }
    }
}

/// What a trigger sees and may mutate. Changes to `new_rec` flow back into
/// the effective request body.
#[derive(Debug, Clone)]
pub struct TriggerPayload {
    pub method: Method,
    pub name: String,
    pub id: Option<String>,
    pub user: String,
    pub old_rec: Value,
    pub new_rec: Value,
}

pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = AppResult<T>> + Send + 'a>>;

/// A trigger runs inside the request transaction; raising an error rolls the
/// whole request back.
pub type Trigger = Arc<
    dyn for<'a> Fn(&'a mut SqliteConnection, &'a mut TriggerPayload) -> HookFuture<'a, ()>
        + Send
        + Sync,
>;

/// A registered function owns its whole request.
pub type RegisteredFunction = Arc<
    dyn for<'a> Fn(&'a mut SqliteConnection, Request) -> HookFuture<'a, Value> + Send + Sync,
>;

/// Triggers keyed by feather + method + position, functions by method +
/// name. At most one trigger per slot.
#[derive(Default)]
pub struct Registry {
    triggers: RwLock<HashMap<(Method, String, TriggerPosition), Trigger>>,
    functions: RwLock<HashMap<(Method, String), RegisteredFunction>>,
}

impl Registry {
    pub fn register_trigger(
        &self,
        method: Method,
        feather: impl Into<String>,
        position: TriggerPosition,
        trigger: Trigger,
    ) -> AppResult<()> {
        let feather = feather.into();
        let mut triggers = self.triggers.write().unwrap_or_else(|e| e.into_inner());
        let key = (method, feather.clone(), position);
        if triggers.contains_key(&key) {
            return Err(AppError::validation(format!(
                "A {method} trigger is already registered on {feather}"
            )));
        }
        triggers.insert(key, trigger);
        Ok(())
    }

    pub fn register_function(
        &self,
        method: Method,
        name: impl Into<String>,
        function: RegisteredFunction,
    ) -> AppResult<()> {
        let name = name.into();
        let mut functions = self.functions.write().unwrap_or_else(|e| e.into_inner());
        if functions.contains_key(&(method, name.clone())) {
            return Err(AppError::validation(format!(
                "Function {name} is already registered for {method}"
            )));
        }
        functions.insert((method, name), function);
        Ok(())
    }

    fn trigger(
        &self,
        method: Method,
        feather: &str,
        position: TriggerPosition,
    ) -> Option<Trigger> {
        self.triggers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(method, feather.to_string(), position))
            .cloned()
    }

    fn function(&self, method: Method, name: &str) -> Option<RegisteredFunction> {
        self.functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(method, name.to_string()))
            .cloned()
    }
}

/// The server core: pool, catalog, trigger registry and notification bus.
pub struct Engine {
    pub pool: SqlitePool,
    pub catalog: Arc<Catalog>,
    pub registry: Arc<Registry>,
    pub bus: Arc<EventBus>,
}

impl Engine {
    pub fn new(pool: SqlitePool) -> AppResult<Self> {
        let engine = Engine {
            pool,
            catalog: Arc::new(Catalog::new()),
            registry: Arc::new(Registry::default()),
            bus: Arc::new(EventBus::new()),
        };
        engine.register_builtins()?;
        Ok(engine)
    }

    /// Out-of-band control operations exposed through `/do`.
    fn register_builtins(&self) -> AppResult<()> {
        let subscribe: RegisteredFunction = Arc::new(|conn, request| {
            Box::pin(async move {
                let subscription: Subscription = serde_json::from_value(
                    request
                        .data
                        .get("subscription")
                        .cloned()
                        .unwrap_or(Value::Null),
                )
                .map_err(|_| AppError::validation("Subscription is malformed"))?;
                let ids: Vec<String> = request
                    .data
                    .get("ids")
                    .and_then(|v| serde_json::from_value::<Vec<String>>(v.clone()).ok())
                    .unwrap_or_default();
                let feather = request
                    .data
                    .get("feather")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                events::subscribe(conn, &subscription, &ids, feather.as_deref()).await?;
                Ok(Value::Bool(true))
            })
        });
        self.registry
            .register_function(Method::Post, "subscribe", subscribe)?;

        let unsubscribe: RegisteredFunction = Arc::new(|conn, request| {
            Box::pin(async move {
                let id = request
                    .data
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let scope = match request
                    .data
                    .get("scope")
                    .and_then(|v| v.as_str())
                    .unwrap_or("subscription")
                {
                    "session" => UnsubscribeScope::Session,
                    "node" => UnsubscribeScope::Node,
                    _ => UnsubscribeScope::Subscription,
                };
                events::unsubscribe(conn, &id, scope).await?;
                Ok(Value::Bool(true))
            })
        });
        self.registry
            .register_function(Method::Post, "unsubscribe", unsubscribe)?;

        let lock: RegisteredFunction = Arc::new(|conn, request| {
            Box::pin(async move {
                let id = request
                    .data
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AppError::validation("Lock requires an id"))?
                    .to_string();
                let event_key = request
                    .data
                    .get("eventKey")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AppError::validation("Lock requires an event key"))?
                    .to_string();
                let node_id = request
                    .data
                    .get("nodeId")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let granted =
                    locks::lock(conn, &node_id, &id, &request.user, &event_key).await?;
                Ok(Value::Bool(granted))
            })
        });
        self.registry.register_function(Method::Post, "lock", lock)?;

        let unlock: RegisteredFunction = Arc::new(|conn, request| {
            Box::pin(async move {
                let criteria: locks::UnlockCriteria =
                    serde_json::from_value(request.data.clone())
                        .map_err(|_| AppError::validation("Unlock criteria are malformed"))?;
                let released = locks::unlock(conn, &criteria).await?;
                Ok(Value::from(released))
            })
        });
        self.registry
            .register_function(Method::Post, "unlock", unlock)?;

        Ok(())
    }

    /// The single request entry point: resolves the name, owns the
    /// transaction, walks triggers, and fans out notifications after commit.
    pub async fn request(&self, payload: Request, is_superuser: bool) -> AppResult<Value> {
        let method = payload.method;
        let name = payload.name.clone();
        let result = self.dispatch(payload, is_superuser).await;
        match &result {
            Ok(_) => {
                info!(target = "plume", event = "request", method = %method, name = %name);
            }
            Err(err) => {
                error!(
                    target = "plume",
                    event = "request_failed",
                    method = %method,
                    name = %name,
                    status = err.status_code(),
                    error = %err
                );
            }
        }
        result
    }

    async fn dispatch(&self, payload: Request, is_superuser: bool) -> AppResult<Value> {
        // camelCase names dispatch to registered functions, PascalCase to
        // feather CRUD.
        let is_function = payload
            .name
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase())
            .unwrap_or(false);

        if is_function {
            let function = self
                .registry
                .function(payload.method, &payload.name)
                .ok_or_else(|| {
                    AppError::not_found(format!(
                        "Function not found: {} {}",
                        payload.method, payload.name
                    ))
                })?;
            if payload.method == Method::Get {
                let mut conn = self.pool.acquire().await.map_err(AppError::from)?;
                return function(&mut *conn, payload).await;
            }
            let mut tx = self.pool.begin().await.map_err(AppError::from)?;
            let result = function(&mut *tx, payload).await;
            match result {
                Ok(value) => {
                    tx.commit().await.map_err(AppError::from)?;
                    Ok(value)
                }
                Err(err) => {
                    let _ = tx.rollback().await;
                    Err(err)
                }
            }
        } else if payload.method == Method::Get {
            // Reads run unwrapped; there is nothing to roll back.
            let mut conn = self.pool.acquire().await.map_err(AppError::from)?;
            let is_superuser =
                is_superuser || auth::is_super_user(&mut *conn, &payload.user).await?;
            let mut ctx = CrudContext::new(&self.catalog, payload.user.clone(), is_superuser);
            let crud_payload = CrudPayload {
                name: payload.name.clone(),
                id: payload.id.clone(),
                data: Value::Null,
                filter: payload.filter.clone(),
                show_deleted: payload.show_deleted,
                subscription: payload.subscription.clone(),
                event_key: payload.event_key.clone(),
                is_hard: false,
            };
            crud::do_select(&mut *conn, &mut ctx, crud_payload, false).await
        } else {
            let mut tx = self.pool.begin().await.map_err(AppError::from)?;
            let is_superuser =
                is_superuser || auth::is_super_user(&mut *tx, &payload.user).await?;
            match self.execute_write(&mut *tx, payload, is_superuser).await {
                Ok((value, changes)) => {
                    tx.commit().await.map_err(AppError::from)?;
                    // Subscribers observe a change no earlier than its commit.
                    let mut conn = self.pool.acquire().await.map_err(AppError::from)?;
                    events::notify(&mut *conn, &self.bus, &changes).await?;
                    Ok(value)
                }
                Err(err) => {
                    let _ = tx.rollback().await;
                    Err(err)
                }
            }
        }
    }

    /// CRUD execution inside the caller's connection or transaction,
    /// including the upsert downgrade and both trigger walks.
    async fn execute_write(
        &self,
        conn: &mut SqliteConnection,
        mut payload: Request,
        is_superuser: bool,
    ) -> AppResult<(Value, Vec<events::Change>)> {
        // POST carrying an id that already resolves becomes a PATCH.
        if payload.method == Method::Post {
            let id = payload.id.clone().or_else(|| {
                payload
                    .data
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            });
            if let Some(id) = id {
                if tools::get_key(conn, &id).await?.is_some() {
                    payload = self.downgrade_to_patch(conn, payload, &id, is_superuser).await?;
                }
            }
        }

        let chain = self.catalog.chain(conn, &payload.name).await?;

        // Before walk runs feather-first up to Object.
        let mut trigger_payload = self.materialize(conn, &payload).await?;
        for feather in chain.iter().rev() {
            if let Some(trigger) =
                self.registry
                    .trigger(payload.method, feather, TriggerPosition::Before)
            {
                trigger(conn, &mut trigger_payload).await?;
                self.propagate_mutation(&mut payload, &trigger_payload)?;
            }
        }

        let mut ctx = CrudContext::new(&self.catalog, payload.user.clone(), is_superuser);
        let crud_payload = CrudPayload {
            name: payload.name.clone(),
            id: payload.id.clone(),
            data: payload.data.clone(),
            filter: payload.filter.clone(),
            show_deleted: payload.show_deleted,
            subscription: payload.subscription.clone(),
            event_key: payload.event_key.clone(),
            is_hard: payload.is_hard,
        };
        let result = match payload.method {
            Method::Post | Method::Put => crud::do_insert(conn, &mut ctx, crud_payload, false).await?,
            Method::Patch => crud::do_update(conn, &mut ctx, crud_payload, false).await?,
            Method::Delete => crud::do_delete(conn, &mut ctx, crud_payload, false).await?,
            Method::Get => unreachable!("reads are dispatched through execute"),
        };

        // After walk reverses: Object down to the feather, final record
        // visible as new_rec.
        trigger_payload.new_rec = ctx
            .changes
            .last()
            .map(|c| {
                if c.action == "delete" {
                    Value::Null
                } else {
                    c.data.clone()
                }
            })
            .unwrap_or(Value::Null);
        for feather in chain.iter() {
            if let Some(trigger) =
                self.registry
                    .trigger(payload.method, feather, TriggerPosition::After)
            {
                trigger(conn, &mut trigger_payload).await?;
            }
        }

        Ok((result, ctx.changes))
    }

    async fn materialize(
        &self,
        conn: &mut SqliteConnection,
        payload: &Request,
    ) -> AppResult<TriggerPayload> {
        let old_rec = match &payload.id {
            Some(id) => {
                let mut ctx =
                    CrudContext::new(&self.catalog, payload.user.clone(), true);
                crud::do_select(
                    conn,
                    &mut ctx,
                    CrudPayload {
                        name: payload.name.clone(),
                        id: Some(id.clone()),
                        ..CrudPayload::default()
                    },
                    false,
                )
                .await?
            }
            None => Value::Null,
        };
        let new_rec = match payload.method {
            Method::Post | Method::Put => payload.data.clone(),
            // A missing record falls through so the CRUD layer reports the
            // not-found instead of a patch error.
            Method::Patch if !old_rec.is_null() => {
                let patch: json_patch::Patch =
                    serde_json::from_value(payload.data.clone()).map_err(AppError::from)?;
                let mut doc = old_rec.clone();
                json_patch::patch(&mut doc, &patch)
                    .map_err(|e| AppError::validation(format!("Patch failed: {e}")))?;
                doc
            }
            _ => Value::Null,
        };
        Ok(TriggerPayload {
            method: payload.method,
            name: payload.name.clone(),
            id: payload.id.clone(),
            user: payload.user.clone(),
            old_rec,
            new_rec,
        })
    }

    /// Push trigger mutations back into the effective request body.
    fn propagate_mutation(
        &self,
        payload: &mut Request,
        trigger_payload: &TriggerPayload,
    ) -> AppResult<()> {
        match payload.method {
            Method::Post | Method::Put => {
                payload.data = trigger_payload.new_rec.clone();
            }
            Method::Patch => {
                let patch =
                    json_patch::diff(&trigger_payload.old_rec, &trigger_payload.new_rec);
                payload.data = serde_json::to_value(patch).map_err(AppError::from)?;
            }
            Method::Delete | Method::Get => {}
        }
        Ok(())
    }

    /// Upsert semantics: missing keys leave the stored value unchanged,
    /// explicit null clears, and nested arrays are taken whole from the
    /// incoming body.
    async fn downgrade_to_patch(
        &self,
        conn: &mut SqliteConnection,
        mut payload: Request,
        id: &str,
        is_superuser: bool,
    ) -> AppResult<Request> {
        let mut ctx = CrudContext::new(&self.catalog, payload.user.clone(), is_superuser);
        let existing = crud::do_select(
            conn,
            &mut ctx,
            CrudPayload {
                name: payload.name.clone(),
                id: Some(id.to_string()),
                ..CrudPayload::default()
            },
            false,
        )
        .await?;
        if existing.is_null() {
            return Err(AppError::conflict(format!(
                "Id {id} exists but is not visible as {}",
                payload.name
            )));
        }
        let incoming = payload
            .data
            .as_object()
            .cloned()
            .ok_or_else(|| AppError::validation("Insert data must be an object"))?;
        let mut ops = Vec::new();
        for (key, value) in &incoming {
            if key == "id" {
                continue;
            }
            let current = existing.get(key).cloned().unwrap_or(Value::Null);
            if current != *value {
                ops.push(json!({
                    "op": "replace",
                    "path": format!("/{key}"),
                    "value": value,
                }));
            }
        }
        info!(
            target = "plume",
            event = "upsert_downgrade",
            feather = %payload.name,
            id = %id,
            ops = ops.len()
        );
        payload.method = Method::Patch;
        payload.id = Some(id.to_string());
        payload.data = Value::Array(ops);
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parses_and_rejects() {
        assert_eq!(Method::from_str("PATCH").unwrap(), Method::Patch);
        assert!(Method::from_str("HEAD").is_err());
    }

    #[test]
    fn registry_rejects_duplicate_triggers() {
        let registry = Registry::default();
        let noop: Trigger = Arc::new(|_, _| Box::pin(async { Ok(()) }));
        registry
            .register_trigger(Method::Post, "Contact", TriggerPosition::Before, noop.clone())
            .unwrap();
        let err = registry
            .register_trigger(Method::Post, "Contact", TriggerPosition::Before, noop)
            .unwrap_err();
        assert!(err.message().contains("already registered"));
    }

    #[test]
    fn registry_allows_one_per_position() {
        let registry = Registry::default();
        let noop: Trigger = Arc::new(|_, _| Box::pin(async { Ok(()) }));
        registry
            .register_trigger(Method::Post, "Contact", TriggerPosition::Before, noop.clone())
            .unwrap();
        registry
            .register_trigger(Method::Post, "Contact", TriggerPosition::After, noop.clone())
            .unwrap();
        registry
            .register_trigger(Method::Patch, "Contact", TriggerPosition::Before, noop)
            .unwrap();
    }
}
