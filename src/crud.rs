use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use sqlx::{Row, SqliteConnection};
use tracing::info;

use crate::auth::{self, AuthRequest};
use crate::error::{AppError, AppResult};
use crate::events::{self, Change, Subscription};
use crate::feathers::{Catalog, Feather, PropertyKind};
use crate::id::new_uuid_v7;
use crate::locks;
use crate::time::{now_utc, today};
use crate::tools::{
    self, bind_value, column_name, money_columns, quote_ident, relation_column, DefaultSpec,
    Filter, JoinBuilder, NO_RELATION, PK,
};

/// Shared state for one request: the caller's identity and the changes that
/// fan out after commit.
pub struct CrudContext<'c> {
    pub catalog: &'c Catalog,
    pub user: String,
    pub is_superuser: bool,
    pub changes: Vec<Change>,
}

impl<'c> CrudContext<'c> {
    pub fn new(catalog: &'c Catalog, user: impl Into<String>, is_superuser: bool) -> Self {
        CrudContext {
            catalog,
            user: user.into(),
            is_superuser,
            changes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CrudPayload {
    pub name: String,
    pub id: Option<String>,
    pub data: Value,
    pub filter: Option<Filter>,
    pub show_deleted: bool,
    pub subscription: Option<Subscription>,
    pub event_key: Option<String>,
    pub is_hard: bool,
}

#[derive(Clone, Copy)]
struct ExpandOpts {
    include_back_refs: bool,
    show_deleted: bool,
}

fn rel_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map.get("id").and_then(|v| v.as_str()).map(str::to_string),
        _ => None,
    }
}

fn encode_json_column(value: &Value) -> Value {
    match value {
        // Already-serialized JSON strings are accepted as-is.
        Value::String(_) => value.clone(),
        other => Value::String(other.to_string()),
    }
}

async fn next_sequence(conn: &mut SqliteConnection, name: &str) -> AppResult<i64> {
    let value: i64 = sqlx::query_scalar(
        "INSERT INTO _sequence (name, value) VALUES (?, 1) \
         ON CONFLICT (name) DO UPDATE SET value = value + 1 \
         RETURNING value",
    )
    .bind(name)
    .fetch_one(&mut *conn)
    .await
    .map_err(AppError::from)?;
    Ok(value)
}

async fn base_currency(conn: &mut SqliteConnection) -> AppResult<String> {
    let data: Option<String> =
        sqlx::query_scalar("SELECT data FROM _settings WHERE name = 'currency'")
            .fetch_optional(&mut *conn)
            .await
            .map_err(AppError::from)?;
    if let Some(data) = data {
        if let Ok(value) = serde_json::from_str::<Value>(&data) {
            if let Some(code) = value.get("baseCurrency").and_then(|v| v.as_str()) {
                return Ok(code.to_string());
            }
        }
    }
    Ok("USD".to_string())
}

async fn default_money(conn: &mut SqliteConnection) -> AppResult<Value> {
    Ok(json!({
        "amount": 0,
        "currency": base_currency(conn).await?,
        "effective": Value::Null,
        "baseAmount": Value::Null,
    }))
}

async fn resolve_default(
    conn: &mut SqliteConnection,
    spec: &DefaultSpec,
) -> AppResult<Value> {
    Ok(match spec {
        DefaultSpec::Literal(value) => value.clone(),
        DefaultSpec::Function(name) => match *name {
            "now()" => Value::String(now_utc()),
            "today()" => Value::String(today()),
            "newId()" => Value::String(new_uuid_v7()),
            "money()" => default_money(conn).await?,
            other => {
                return Err(AppError::validation(format!(
                    "Unknown default function: {other}"
                )))
            }
        },
    })
}

fn format_autonumber(auto: &crate::feathers::Autonumber, value: i64) -> String {
    let digits = value.to_string();
    let width = auto.length as usize;
    let padded = if digits.len() < width {
        format!("{}{}", "0".repeat(width - digits.len()), digits)
    } else {
        digits
    };
    format!(
        "{}{}{}",
        auto.prefix.as_deref().unwrap_or(""),
        padded,
        auto.suffix.as_deref().unwrap_or("")
    )
}

async fn write_log(
    conn: &mut SqliteConnection,
    object_id: &str,
    action: &str,
    user: &str,
    change: &Value,
) -> AppResult<()> {
    let now = now_utc();
    sqlx::query(
        "INSERT INTO log (object_id, action, created, created_by, updated, updated_by, change) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(object_id)
    .bind(action)
    .bind(&now)
    .bind(user)
    .bind(&now)
    .bind(user)
    .bind(change.to_string())
    .execute(&mut *conn)
    .await
    .map_err(AppError::from)?;
    Ok(())
}

async fn check_natural_key(
    conn: &mut SqliteConnection,
    feather: &Feather,
    property: &str,
    value: &Value,
    exclude_id: Option<&str>,
) -> AppResult<()> {
    let table = quote_ident(&feather.table())?;
    let column = quote_ident(&column_name(property))?;
    let mut sql = format!(
        "SELECT EXISTS (SELECT 1 FROM {table} WHERE {column} = ? AND is_deleted = 0"
    );
    if exclude_id.is_some() {
        sql.push_str(" AND id != ?");
    }
    sql.push(')');
    let mut query = bind_value(sqlx::query(&sql), value);
    if let Some(id) = exclude_id {
        query = query.bind(id);
    }
    let row = query.fetch_one(&mut *conn).await.map_err(AppError::from)?;
    let taken: i64 = row.get(0);
    if taken != 0 {
        let label = feather
            .property(property)
            .map(|p| p.label(property))
            .unwrap_or_else(|| property.to_string());
        let shown = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Err(AppError::conflict(format!(
            "Value '{shown}' assigned to {label} on {} is not unique to data type {}.",
            feather.name, feather.name
        )));
    }
    Ok(())
}

fn check_lock(lock: Option<locks::Lock>, event_key: Option<&str>) -> AppResult<()> {
    if let Some(lock) = lock {
        if event_key != Some(lock.event_key.as_str()) {
            return Err(AppError::conflict(format!(
                "Record is locked by {}",
                lock.username
            )));
        }
    }
    Ok(())
}

fn reject_unknown_properties(feather: &Feather, data: &Map<String, Value>) -> AppResult<()> {
    for key in data.keys() {
        if SYSTEM_PROPERTIES.contains(&key.as_str()) {
            continue;
        }
        if feather.property(key).is_none() {
            return Err(AppError::validation(format!(
                "Unknown property {key} on {}",
                feather.name
            )));
        }
    }
    Ok(())
}

/// Properties whose values the server owns. `lock` has no physical column;
/// it is synthesized on read from the lock registry.
const SYSTEM_PROPERTIES: &[&str] = &[
    "id",
    "created",
    "createdBy",
    "updated",
    "updatedBy",
    "isDeleted",
    "etag",
    "lock",
];

// ---------------------------------------------------------------------------
// Insert
// ---------------------------------------------------------------------------

/// Insert one object, recursing into composite and child relations. Returns
/// the JSON-patch difference between the request body and the persisted
/// record so the caller can reconcile server-assigned values.
pub fn do_insert<'a, 'c: 'a>(
    conn: &'a mut SqliteConnection,
    ctx: &'a mut CrudContext<'c>,
    payload: CrudPayload,
    is_child: bool,
) -> BoxFuture<'a, AppResult<Value>> {
    async move {
        let feather = ctx.catalog.feather(conn, &payload.name).await?;
        if feather.is_child && !is_child && !ctx.is_superuser {
            return Err(AppError::validation(format!(
                "Feather {} is a child and may not be inserted directly",
                feather.name
            )));
        }
        if feather.is_read_only && !ctx.is_superuser {
            return Err(AppError::validation(format!(
                "Feather {} is read only",
                feather.name
            )));
        }

        let request = payload.data.clone();
        let data = match payload.data {
            Value::Object(map) => map,
            _ => return Err(AppError::validation("Insert data must be an object")),
        };
        reject_unknown_properties(&feather, &data)?;
        for (name, prop) in &feather.properties {
            if prop.is_read_only
                && !SYSTEM_PROPERTIES.contains(&name.as_str())
                && data.contains_key(name)
            {
                return Err(AppError::validation(format!(
                    "{} is read only on {}",
                    prop.label(name),
                    feather.name
                )));
            }
        }

        let id = payload
            .id
            .clone()
            .or_else(|| data.get("id").and_then(|v| v.as_str()).map(str::to_string))
            .unwrap_or_else(new_uuid_v7);
        if tools::get_key(conn, &id).await?.is_some() {
            return Err(AppError::conflict(format!("Id {id} already exists")));
        }

        // Single natural key probe before any write.
        for (name, prop) in &feather.properties {
            if prop.is_natural_key && prop.autonumber.is_none() {
                if let Some(value) = data.get(name) {
                    if !value.is_null() {
                        check_natural_key(conn, &feather, name, value, None).await?;
                    }
                }
            }
        }

        // Containing folder, for member-grant checks and propagation.
        let folder_id = feather.properties.iter().find_map(|(name, prop)| {
            matches!(prop.kind(), PropertyKind::ToOne { relation, .. } if relation == "Folder")
                .then(|| data.get(name).and_then(rel_id))
                .flatten()
        });

        if !is_child && !ctx.is_superuser {
            let allowed = auth::is_authorized(
                conn,
                ctx.catalog,
                &AuthRequest {
                    action: "canCreate".to_string(),
                    feather: Some(feather.name.clone()),
                    id: None,
                    folder: folder_id.clone(),
                    user: ctx.user.clone(),
                },
            )
            .await?;
            if !allowed {
                return Err(AppError::unauthorized(format!(
                    "Not authorized to create {}",
                    feather.name
                )));
            }
        }

        let registry = sqlx::query("INSERT INTO object (id, feather) VALUES (?, ?)")
            .bind(&id)
            .bind(&feather.name)
            .execute(&mut *conn)
            .await
            .map_err(AppError::from)?;
        let pk = registry.last_insert_rowid();

        let now = now_utc();
        let etag = new_uuid_v7();
        let mut columns: Vec<String> = vec![PK.to_string()];
        let mut values: Vec<Value> = vec![Value::from(pk)];
        let mut pending_children: Vec<(String, String, Vec<Value>)> = Vec::new();

        for (name, prop) in &feather.properties {
            match prop.kind() {
                PropertyKind::Scalar { scalar, format } => {
                    let column = quote_ident(&column_name(name))?;
                    let system_value = match name.as_str() {
                        "id" => Some(Value::String(id.clone())),
                        "created" | "updated" => Some(Value::String(now.clone())),
                        "createdBy" | "updatedBy" => Some(Value::String(ctx.user.clone())),
                        "isDeleted" => Some(Value::Bool(false)),
                        "etag" => Some(Value::String(etag.clone())),
                        _ => None,
                    };
                    if let Some(value) = system_value {
                        columns.push(column);
                        values.push(value);
                        continue;
                    }
                    if let Some(auto) = &prop.autonumber {
                        let next = next_sequence(conn, &auto.sequence).await?;
                        columns.push(column);
                        values.push(Value::String(format_autonumber(auto, next)));
                        continue;
                    }
                    let mut value = match data.get(name) {
                        Some(v) => v.clone(),
                        None => resolve_default(conn, &prop.default_spec()).await?,
                    };
                    if format.as_deref() == Some("money") {
                        if value.is_null() {
                            value = default_money(conn).await?;
                        }
                        let [amount, currency, effective, base] = money_columns(name);
                        for col in [&amount, &currency, &effective, &base] {
                            columns.push(quote_ident(col)?);
                        }
                        values.push(value.get("amount").cloned().unwrap_or(json!(0)));
                        values.push(value.get("currency").cloned().unwrap_or(json!("")));
                        values.push(value.get("effective").cloned().unwrap_or(Value::Null));
                        values.push(value.get("baseAmount").cloned().unwrap_or(Value::Null));
                        continue;
                    }
                    if (scalar == "object" || scalar == "array") && !value.is_null() {
                        value = encode_json_column(&value);
                    }
                    columns.push(column);
                    values.push(value);
                }
                PropertyKind::ToOne {
                    relation, is_child: composite, ..
                } => {
                    let column = quote_ident(&relation_column(name))?;
                    let value = data.get(name).cloned().unwrap_or(Value::Null);
                    if value.is_null() {
                        columns.push(column);
                        values.push(Value::from(NO_RELATION));
                        continue;
                    }
                    if composite {
                        let child_payload = CrudPayload {
                            name: relation.clone(),
                            data: value,
                            ..CrudPayload::default()
                        };
                        do_insert(conn, ctx, child_payload, true).await?;
                        // The recursion just registered the child id.
                        let child_id = ctx
                            .changes
                            .last()
                            .map(|c| c.id.clone())
                            .unwrap_or_default();
                        let child_pk = tools::get_key(conn, &child_id)
                            .await?
                            .map(|(pk, _)| pk)
                            .unwrap_or(NO_RELATION);
                        columns.push(column);
                        values.push(Value::from(child_pk));
                    } else {
                        let target_id = rel_id(&value).ok_or_else(|| {
                            AppError::validation(format!(
                                "Relation {name} on {} requires an id",
                                feather.name
                            ))
                        })?;
                        let target_pk = tools::get_key(conn, &target_id)
                            .await?
                            .map(|(pk, _)| pk)
                            .ok_or_else(|| {
                                AppError::not_found(format!(
                                    "Relation target not found: {target_id}"
                                ))
                            })?;
                        columns.push(column);
                        values.push(Value::from(target_pk));
                    }
                }
                PropertyKind::ChildBackRef { .. } => {
                    let column = quote_ident(&relation_column(name))?;
                    let value = data.get(name).cloned().unwrap_or(Value::Null);
                    let parent_pk = match rel_id(&value) {
                        Some(parent_id) => tools::get_key(conn, &parent_id)
                            .await?
                            .map(|(pk, _)| pk)
                            .unwrap_or(NO_RELATION),
                        None => NO_RELATION,
                    };
                    columns.push(column);
                    values.push(Value::from(parent_pk));
                }
                PropertyKind::ToMany { relation, back_ref } => {
                    if let Some(items) = data.get(name).and_then(|v| v.as_array()) {
                        pending_children.push((relation, back_ref, items.clone()));
                    }
                }
            }
        }

        let placeholders: Vec<&str> = values.iter().map(|_| "?").collect();
        let table = quote_ident(&feather.table())?;
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for value in &values {
            query = bind_value(query, value);
        }
        query.execute(&mut *conn).await.map_err(AppError::from)?;

        // Children are stamped with the back-reference and inserted in the
        // same transaction, ordered by their own surrogate keys.
        for (relation, back_ref, items) in pending_children {
            for item in items {
                let mut child_data = match item {
                    Value::Object(map) => map,
                    other => {
                        return Err(AppError::validation(format!(
                            "Child rows of {} must be objects, got {other}",
                            feather.name
                        )))
                    }
                };
                child_data.insert(back_ref.to_string(), json!({ "id": id.clone() }));
                let child_payload = CrudPayload {
                    name: relation.to_string(),
                    data: Value::Object(child_data),
                    ..CrudPayload::default()
                };
                do_insert(conn, ctx, child_payload, true).await?;
            }
        }

        let persisted = read_record(
            conn,
            ctx.catalog,
            &feather,
            &id,
            ExpandOpts {
                include_back_refs: false,
                show_deleted: false,
            },
        )
        .await?
        .ok_or_else(|| AppError::new("CRUD/REREAD", "Inserted record did not read back"))?;

        write_log(conn, &id, "POST", &ctx.user, &persisted).await?;
        if let Some(folder_id) = &folder_id {
            auth::propagate_auth(conn, ctx.catalog, folder_id, None, false).await?;
        }

        ctx.changes.push(Change {
            id: id.clone(),
            feather: feather.name.clone(),
            action: "create",
            data: persisted.clone(),
        });
        info!(target = "plume", event = "insert", feather = %feather.name, id = %id);

        let diff = json_patch::diff(&request, &persisted);
        Ok(serde_json::to_value(diff).map_err(AppError::from)?)
    }
    .boxed()
}

// ---------------------------------------------------------------------------
// Select
// ---------------------------------------------------------------------------

/// Read one object or a filtered set. Results are sanitized; relation
/// columns resolve through sub-queries and `parentOf` arrays come back
/// ordered by surrogate key.
pub fn do_select<'a, 'c: 'a>(
    conn: &'a mut SqliteConnection,
    ctx: &'a mut CrudContext<'c>,
    payload: CrudPayload,
    is_child: bool,
) -> BoxFuture<'a, AppResult<Value>> {
    async move {
        let feather = ctx.catalog.feather(conn, &payload.name).await?;
        if feather.is_child && !is_child && !ctx.is_superuser {
            return Err(AppError::validation(format!(
                "Feather {} is a child and may not be queried directly",
                feather.name
            )));
        }

        let filter = payload.filter.clone().unwrap_or_default();
        if filter.limit == Some(0) {
            return Ok(json!([]));
        }

        let table = quote_ident(&feather.table())?;
        let mut select_cols: Vec<String> = vec![format!("t.{PK}")];
        for (name, prop) in &feather.properties {
            match prop.kind() {
                PropertyKind::Scalar { format, .. } => {
                    if format.as_deref() == Some("money") {
                        for col in money_columns(name) {
                            select_cols.push(format!("t.{}", quote_ident(&col)?));
                        }
                    } else {
                        select_cols.push(format!("t.{}", quote_ident(&column_name(name))?));
                    }
                }
                PropertyKind::ToOne { .. } | PropertyKind::ChildBackRef { .. } => {
                    select_cols.push(format!("t.{}", quote_ident(&relation_column(name))?));
                }
                PropertyKind::ToMany { .. } => {}
            }
        }

        let mut joins = JoinBuilder::default();
        let mut params: Vec<Value> = Vec::new();
        let mut wheres: Vec<String> = Vec::new();

        if let Some(id) = &payload.id {
            wheres.push("t.id = ?".to_string());
            params.push(Value::String(id.clone()));
        }
        if !payload.show_deleted {
            wheres.push("t.is_deleted = 0".to_string());
        }
        let criteria_sql = tools::process_criteria(
            conn,
            ctx.catalog,
            &feather,
            &filter.criteria,
            &mut joins,
            &mut params,
        )
        .await?;
        if !criteria_sql.is_empty() {
            wheres.push(criteria_sql);
        }
        if !ctx.is_superuser && !is_child {
            let feather_pk = ctx.catalog.feather_pk(conn, &feather.name).await?;
            let roles = auth::user_roles(conn, &ctx.user).await?;
            wheres.push(tools::build_auth_sql(
                "can_read",
                "t",
                &roles,
                feather_pk,
                &mut params,
            )?);
        }

        let order_by =
            tools::process_sort(conn, ctx.catalog, &feather, &filter.sort, &mut joins).await?;

        let mut sql = format!(
            "SELECT {} FROM {table} t{}",
            select_cols.join(", "),
            joins.sql()
        );
        if !wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&wheres.join(" AND "));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_by);
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            params.push(Value::from(limit));
        }
        if let Some(offset) = filter.offset {
            if filter.limit.is_none() {
                sql.push_str(" LIMIT -1");
            }
            sql.push_str(" OFFSET ?");
            params.push(Value::from(offset));
        }

        let mut query = sqlx::query(&sql);
        for value in &params {
            query = bind_value(query, value);
        }
        let rows = query.fetch_all(&mut *conn).await.map_err(AppError::from)?;

        let opts = ExpandOpts {
            include_back_refs: true,
            show_deleted: payload.show_deleted,
        };
        let mut records = Vec::with_capacity(rows.len());
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let raw = tools::row_to_json(row);
            if let Some(Value::String(id)) = raw.get("id") {
                ids.push(id.clone());
            }
            records.push(expand_record(conn, ctx.catalog, &feather, raw, opts).await?);
        }

        if let Some(subscription) = &payload.subscription {
            let unconstrained = payload.id.is_none() && filter.criteria.is_empty();
            let feather_target = unconstrained.then(|| feather.name.clone());
            events::subscribe(conn, subscription, &ids, feather_target.as_deref()).await?;
        }

        if payload.id.is_some() {
            Ok(records.into_iter().next().unwrap_or(Value::Null))
        } else {
            Ok(Value::Array(records))
        }
    }
    .boxed()
}

/// Read a single record by id without authorization, for internal re-reads.
fn read_record<'a>(
    conn: &'a mut SqliteConnection,
    catalog: &'a Catalog,
    feather: &'a Feather,
    id: &'a str,
    opts: ExpandOpts,
) -> BoxFuture<'a, AppResult<Option<Value>>> {
    async move {
        let table = quote_ident(&feather.table())?;
        let mut sql = format!("SELECT * FROM {table} WHERE id = ?");
        if !opts.show_deleted {
            sql.push_str(" AND is_deleted = 0");
        }
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(AppError::from)?;
        match row {
            Some(row) => {
                let raw = tools::row_to_json(&row);
                Ok(Some(expand_record(conn, catalog, feather, raw, opts).await?))
            }
            None => Ok(None),
        }
    }
    .boxed()
}

fn read_record_by_pk<'a>(
    conn: &'a mut SqliteConnection,
    catalog: &'a Catalog,
    feather: &'a Feather,
    pk: i64,
    opts: ExpandOpts,
) -> BoxFuture<'a, AppResult<Option<Value>>> {
    async move {
        let table = quote_ident(&feather.table())?;
        let sql = format!("SELECT * FROM {table} WHERE {PK} = ?");
        let row = sqlx::query(&sql)
            .bind(pk)
            .fetch_optional(&mut *conn)
            .await
            .map_err(AppError::from)?;
        match row {
            Some(row) => {
                let raw = tools::row_to_json(&row);
                Ok(Some(expand_record(conn, catalog, feather, raw, opts).await?))
            }
            None => Ok(None),
        }
    }
    .boxed()
}

/// Turn a raw row into the wire shape: booleans coerced, JSON columns
/// parsed, money recomposed, relations resolved, keys camelized and
/// internals stripped.
fn expand_record<'a>(
    conn: &'a mut SqliteConnection,
    catalog: &'a Catalog,
    feather: &'a Feather,
    raw: Map<String, Value>,
    opts: ExpandOpts,
) -> BoxFuture<'a, AppResult<Value>> {
    async move {
        let pk = raw.get(PK).and_then(|v| v.as_i64()).unwrap_or(NO_RELATION);
        let mut record = Map::new();
        record.insert(PK.to_string(), Value::from(pk));

        for (name, prop) in &feather.properties {
            match prop.kind() {
                PropertyKind::Scalar { scalar, format } => {
                    if format.as_deref() == Some("money") {
                        let [amount, currency, effective, base] = money_columns(name);
                        let money = json!({
                            "amount": raw.get(&amount).cloned().unwrap_or(Value::Null),
                            "currency": raw.get(&currency).cloned().unwrap_or(Value::Null),
                            "effective": raw.get(&effective).cloned().unwrap_or(Value::Null),
                            "baseAmount": raw.get(&base).cloned().unwrap_or(Value::Null),
                        });
                        record.insert(column_name(name), money);
                        continue;
                    }
                    let mut value = raw.get(&column_name(name)).cloned().unwrap_or(Value::Null);
                    if scalar == "boolean" {
                        if let Some(n) = value.as_i64() {
                            value = Value::Bool(n != 0);
                        }
                    } else if (scalar == "object" || scalar == "array") && value.is_string() {
                        if let Ok(parsed) = serde_json::from_str::<Value>(value.as_str().unwrap())
                        {
                            value = parsed;
                        }
                    }
                    record.insert(column_name(name), value);
                }
                PropertyKind::ToOne {
                    relation,
                    is_child: composite,
                    properties,
                } => {
                    let target_pk = raw
                        .get(&relation_column(name))
                        .and_then(|v| v.as_i64())
                        .unwrap_or(NO_RELATION);
                    if target_pk == NO_RELATION {
                        record.insert(column_name(name), Value::Null);
                        continue;
                    }
                    let target = catalog.feather(conn, &relation).await?;
                    let value = if composite {
                        read_record_by_pk(conn, catalog, &target, target_pk, opts)
                            .await?
                            .unwrap_or(Value::Null)
                    } else {
                        select_reference(conn, &target, target_pk, properties.as_deref()).await?
                    };
                    record.insert(column_name(name), value);
                }
                PropertyKind::ChildBackRef { relation, .. } => {
                    if !opts.include_back_refs {
                        continue;
                    }
                    let target_pk = raw
                        .get(&relation_column(name))
                        .and_then(|v| v.as_i64())
                        .unwrap_or(NO_RELATION);
                    if target_pk == NO_RELATION {
                        record.insert(column_name(name), Value::Null);
                        continue;
                    }
                    let target = catalog.feather(conn, &relation).await?;
                    let value = select_reference(conn, &target, target_pk, Some(&[])).await?;
                    record.insert(column_name(name), value);
                }
                PropertyKind::ToMany { relation, back_ref } => {
                    let child = catalog.feather(conn, &relation).await?;
                    let child_table = quote_ident(&child.table())?;
                    let back_col = quote_ident(&relation_column(&back_ref))?;
                    let mut sql = format!(
                        "SELECT * FROM {child_table} WHERE {back_col} = ?"
                    );
                    if !opts.show_deleted {
                        sql.push_str(" AND is_deleted = 0");
                    }
                    sql.push_str(&format!(" ORDER BY {PK}"));
                    let rows = sqlx::query(&sql)
                        .bind(pk)
                        .fetch_all(&mut *conn)
                        .await
                        .map_err(AppError::from)?;
                    let mut items = Vec::with_capacity(rows.len());
                    for row in &rows {
                        let raw_child = tools::row_to_json(row);
                        items
                            .push(expand_record(conn, catalog, &child, raw_child, opts).await?);
                    }
                    record.insert(column_name(name), Value::Array(items));
                }
            }
        }

        // The lock composite lives in the registry, not on the row; readers
        // see the current holder or null.
        if let Some(id) = raw.get("id").and_then(|v| v.as_str()) {
            let lock = locks::find(conn, id).await?;
            let lock = match lock {
                Some(lock) => serde_json::to_value(lock).map_err(AppError::from)?,
                None => Value::Null,
            };
            record.insert("lock".to_string(), lock);
        }

        Ok(tools::sanitize(&Value::Object(record)))
    }
    .boxed()
}

/// Shallow reference view of a related record: the requested scalar
/// properties, `id` always included.
async fn select_reference(
    conn: &mut SqliteConnection,
    feather: &Feather,
    pk: i64,
    properties: Option<&[String]>,
) -> AppResult<Value> {
    let table = quote_ident(&feather.table())?;
    let sql = format!("SELECT * FROM {table} WHERE {PK} = ?");
    let row = sqlx::query(&sql)
        .bind(pk)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::from)?;
    let Some(row) = row else {
        return Ok(Value::Null);
    };
    let raw = tools::row_to_json(&row);

    let mut include: Vec<&str> = vec!["id"];
    match properties {
        Some(list) => include.extend(list.iter().map(String::as_str)),
        None => {
            for (name, prop) in &feather.properties {
                if matches!(prop.kind(), PropertyKind::Scalar { .. }) && name != "id" {
                    include.push(name);
                }
            }
        }
    }

    let mut out = Map::new();
    for name in include {
        let Some(prop) = feather.property(name) else {
            continue;
        };
        if let PropertyKind::Scalar { scalar, format } = prop.kind() {
            if format.as_deref() == Some("money") {
                let [amount, currency, effective, base] = money_columns(name);
                out.insert(
                    column_name(name),
                    json!({
                        "amount": raw.get(&amount).cloned().unwrap_or(Value::Null),
                        "currency": raw.get(&currency).cloned().unwrap_or(Value::Null),
                        "effective": raw.get(&effective).cloned().unwrap_or(Value::Null),
                        "baseAmount": raw.get(&base).cloned().unwrap_or(Value::Null),
                    }),
                );
                continue;
            }
            let mut value = raw.get(&column_name(name)).cloned().unwrap_or(Value::Null);
            if scalar == "boolean" {
                if let Some(n) = value.as_i64() {
                    value = Value::Bool(n != 0);
                }
            } else if (scalar == "object" || scalar == "array") && value.is_string() {
                if let Ok(parsed) = serde_json::from_str::<Value>(value.as_str().unwrap()) {
                    value = parsed;
                }
            }
            out.insert(column_name(name), value);
        }
    }
    Ok(tools::sanitize(&Value::Object(out)))
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

/// Apply an RFC 6902 patch to one object. The returned patch is computed
/// from the caller's intended record to the persisted one, so trigger
/// mutations reconcile cleanly on the client.
pub fn do_update<'a, 'c: 'a>(
    conn: &'a mut SqliteConnection,
    ctx: &'a mut CrudContext<'c>,
    payload: CrudPayload,
    is_child: bool,
) -> BoxFuture<'a, AppResult<Value>> {
    async move {
        let patch_value = payload.data.clone();
        let empty = patch_value.as_array().map(|a| a.is_empty()).unwrap_or(false);
        if empty {
            return Ok(json!([]));
        }

        let feather = ctx.catalog.feather(conn, &payload.name).await?;
        if feather.is_child && !is_child && !ctx.is_superuser {
            return Err(AppError::validation(format!(
                "Feather {} is a child and may not be updated directly",
                feather.name
            )));
        }
        if feather.is_read_only && !ctx.is_superuser {
            return Err(AppError::validation(format!(
                "Feather {} is read only",
                feather.name
            )));
        }
        let id = payload
            .id
            .clone()
            .ok_or_else(|| AppError::validation("Update requires an id"))?;

        if !is_child && !ctx.is_superuser {
            let allowed = auth::is_authorized(
                conn,
                ctx.catalog,
                &AuthRequest {
                    action: "canUpdate".to_string(),
                    feather: None,
                    id: Some(id.clone()),
                    folder: None,
                    user: ctx.user.clone(),
                },
            )
            .await?;
            if !allowed {
                return Err(AppError::unauthorized(format!(
                    "Not authorized to update {}",
                    feather.name
                )));
            }
        }

        let opts = ExpandOpts {
            include_back_refs: false,
            show_deleted: false,
        };
        let old_rec = read_record(conn, ctx.catalog, &feather, &id, opts)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Record not found: {id}")))?;

        check_lock(locks::find(conn, &id).await?, payload.event_key.as_deref())?;

        let patch: json_patch::Patch =
            serde_json::from_value(patch_value).map_err(AppError::from)?;
        let mut new_rec = old_rec.clone();
        json_patch::patch(&mut new_rec, &patch)
            .map_err(|e| AppError::validation(format!("Patch failed: {e}")))?;
        let cache_rec = new_rec.clone();

        let old = old_rec.as_object().cloned().unwrap_or_default();
        let new = new_rec.as_object().cloned().unwrap_or_default();
        reject_unknown_properties(&feather, &new)?;

        // A patch that asserts the etag must assert the current one.
        if let (Some(old_etag), Some(new_etag)) = (old.get("etag"), new.get("etag")) {
            if old_etag != new_etag {
                return Err(AppError::conflict(format!(
                    "Etag mismatch on {id}; the record has changed"
                )));
            }
        }

        for (name, prop) in &feather.properties {
            if prop.is_read_only
                && !SYSTEM_PROPERTIES.contains(&name.as_str())
                && old.get(name) != new.get(name)
            {
                return Err(AppError::validation(format!(
                    "{} is read only on {}",
                    prop.label(name),
                    feather.name
                )));
            }
            if prop.is_required {
                if let Some(value) = new.get(name) {
                    if value.is_null() {
                        return Err(AppError::validation(format!(
                            "{} is required on {}",
                            prop.label(name),
                            feather.name
                        )));
                    }
                }
            }
            if prop.is_natural_key && prop.autonumber.is_none() {
                let changed = old.get(name) != new.get(name);
                if changed {
                    if let Some(value) = new.get(name) {
                        if !value.is_null() {
                            check_natural_key(conn, &feather, name, value, Some(&id)).await?;
                        }
                    }
                }
            }
        }

        let now = now_utc();
        let etag = new_uuid_v7();
        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        for (name, prop) in &feather.properties {
            if SYSTEM_PROPERTIES.contains(&name.as_str()) {
                continue;
            }
            let old_value = old.get(name).cloned().unwrap_or(Value::Null);
            let new_value = new.get(name).cloned().unwrap_or(Value::Null);
            match prop.kind() {
                PropertyKind::Scalar { scalar, format } => {
                    if old_value == new_value {
                        continue;
                    }
                    if format.as_deref() == Some("money") {
                        let [amount, currency, effective, base] = money_columns(name);
                        let money = if new_value.is_null() {
                            json!({"amount": null, "currency": null, "effective": null, "baseAmount": null})
                        } else {
                            new_value.clone()
                        };
                        for (col, key) in [
                            (amount, "amount"),
                            (currency, "currency"),
                            (effective, "effective"),
                            (base, "baseAmount"),
                        ] {
                            sets.push(format!("{} = ?", quote_ident(&col)?));
                            params.push(money.get(key).cloned().unwrap_or(Value::Null));
                        }
                        continue;
                    }
                    let column = quote_ident(&column_name(name))?;
                    let bound = if (scalar == "object" || scalar == "array")
                        && !new_value.is_null()
                    {
                        encode_json_column(&new_value)
                    } else {
                        new_value.clone()
                    };
                    sets.push(format!("{column} = ?"));
                    params.push(bound);
                }
                PropertyKind::ToOne {
                    relation,
                    is_child: composite,
                    ..
                } => {
                    let column = quote_ident(&relation_column(name))?;
                    if composite {
                        let old_id = rel_id(&old_value);
                        let new_id = rel_id(&new_value);
                        match (&old_value, &new_value) {
                            (Value::Null, Value::Null) => {}
                            (Value::Null, _) => {
                                let child_payload = CrudPayload {
                                    name: relation.clone(),
                                    data: new_value.clone(),
                                    ..CrudPayload::default()
                                };
                                do_insert(conn, ctx, child_payload, true).await?;
                                let child_id = ctx
                                    .changes
                                    .last()
                                    .map(|c| c.id.clone())
                                    .unwrap_or_default();
                                let child_pk = tools::get_key(conn, &child_id)
                                    .await?
                                    .map(|(pk, _)| pk)
                                    .unwrap_or(NO_RELATION);
                                sets.push(format!("{column} = ?"));
                                params.push(Value::from(child_pk));
                            }
                            (_, Value::Null) => {
                                if let Some(old_id) = old_id {
                                    let child_payload = CrudPayload {
                                        name: relation.clone(),
                                        id: Some(old_id),
                                        ..CrudPayload::default()
                                    };
                                    do_delete(conn, ctx, child_payload, true).await?;
                                }
                                sets.push(format!("{column} = ?"));
                                params.push(Value::from(NO_RELATION));
                            }
                            _ => {
                                if old_id != new_id {
                                    return Err(AppError::validation(format!(
                                        "Child {name} on {} may not change id",
                                        feather.name
                                    )));
                                }
                                let child_patch =
                                    json_patch::diff(&old_value, &new_value);
                                let child_patch =
                                    serde_json::to_value(child_patch).map_err(AppError::from)?;
                                if child_patch.as_array().map(|a| !a.is_empty()).unwrap_or(false)
                                {
                                    let child_payload = CrudPayload {
                                        name: relation.clone(),
                                        id: old_id,
                                        data: child_patch,
                                        event_key: payload.event_key.clone(),
                                        ..CrudPayload::default()
                                    };
                                    do_update(conn, ctx, child_payload, true).await?;
                                }
                            }
                        }
                    } else {
                        let old_id = rel_id(&old_value);
                        let new_id = rel_id(&new_value);
                        if old_id == new_id {
                            continue;
                        }
                        let target_pk = match new_id {
                            Some(target_id) => tools::get_key(conn, &target_id)
                                .await?
                                .map(|(pk, _)| pk)
                                .ok_or_else(|| {
                                    AppError::not_found(format!(
                                        "Relation target not found: {target_id}"
                                    ))
                                })?,
                            None => NO_RELATION,
                        };
                        sets.push(format!("{column} = ?"));
                        params.push(Value::from(target_pk));
                    }
                }
                PropertyKind::ChildBackRef { .. } => {
                    // Back-pointers are stamped by the parent and never
                    // rewritten through a child patch.
                }
                PropertyKind::ToMany { relation, back_ref } => {
                    let old_items = old_value.as_array().cloned().unwrap_or_default();
                    let new_items = new_value.as_array().cloned().unwrap_or_default();
                    let old_ids: Vec<String> =
                        old_items.iter().filter_map(rel_id).collect();
                    let new_ids: Vec<String> =
                        new_items.iter().filter_map(rel_id).collect();

                    for old_item in &old_items {
                        let Some(old_id) = rel_id(old_item) else { continue };
                        if !new_ids.contains(&old_id) {
                            let child_payload = CrudPayload {
                                name: relation.clone(),
                                id: Some(old_id),
                                event_key: payload.event_key.clone(),
                                is_hard: payload.is_hard,
                                ..CrudPayload::default()
                            };
                            do_delete(conn, ctx, child_payload, true).await?;
                        }
                    }
                    for new_item in &new_items {
                        match rel_id(new_item).filter(|nid| old_ids.contains(nid)) {
                            Some(existing_id) => {
                                let old_item = old_items
                                    .iter()
                                    .find(|o| rel_id(o).as_deref() == Some(&existing_id))
                                    .cloned()
                                    .unwrap_or(Value::Null);
                                let child_patch = json_patch::diff(&old_item, new_item);
                                let child_patch =
                                    serde_json::to_value(child_patch).map_err(AppError::from)?;
                                if child_patch
                                    .as_array()
                                    .map(|a| !a.is_empty())
                                    .unwrap_or(false)
                                {
                                    let child_payload = CrudPayload {
                                        name: relation.clone(),
                                        id: Some(existing_id),
                                        data: child_patch,
                                        event_key: payload.event_key.clone(),
                                        ..CrudPayload::default()
                                    };
                                    do_update(conn, ctx, child_payload, true).await?;
                                }
                            }
                            None => {
                                let mut child_data = match new_item.clone() {
                                    Value::Object(map) => map,
                                    other => {
                                        return Err(AppError::validation(format!(
                                            "Child rows of {} must be objects, got {other}",
                                            feather.name
                                        )))
                                    }
                                };
                                child_data
                                    .insert(back_ref.clone(), json!({ "id": id.clone() }));
                                let child_payload = CrudPayload {
                                    name: relation.clone(),
                                    data: Value::Object(child_data),
                                    ..CrudPayload::default()
                                };
                                do_insert(conn, ctx, child_payload, true).await?;
                            }
                        }
                    }
                }
            }
        }

        let changed = !sets.is_empty()
            || json_patch::diff(&old_rec, &new_rec)
                .0
                .iter()
                .next()
                .is_some();
        if !changed {
            return Ok(json!([]));
        }

        sets.push("updated = ?".to_string());
        params.push(Value::String(now.clone()));
        sets.push("updated_by = ?".to_string());
        params.push(Value::String(ctx.user.clone()));
        sets.push("etag = ?".to_string());
        params.push(Value::String(etag));

        let table = quote_ident(&feather.table())?;
        let sql = format!("UPDATE {table} SET {} WHERE id = ?", sets.join(", "));
        let mut query = sqlx::query(&sql);
        for value in &params {
            query = bind_value(query, value);
        }
        query = query.bind(&id);
        query.execute(&mut *conn).await.map_err(AppError::from)?;

        let persisted = read_record(conn, ctx.catalog, &feather, &id, opts)
            .await?
            .ok_or_else(|| AppError::new("CRUD/REREAD", "Updated record did not read back"))?;

        let server_change = json_patch::diff(&old_rec, &persisted);
        write_log(
            conn,
            &id,
            "PATCH",
            &ctx.user,
            &serde_json::to_value(server_change).map_err(AppError::from)?,
        )
        .await?;

        sqlx::query("DELETE FROM _lock WHERE object_id = ?")
            .bind(&id)
            .execute(&mut *conn)
            .await
            .map_err(AppError::from)?;

        ctx.changes.push(Change {
            id: id.clone(),
            feather: feather.name.clone(),
            action: "update",
            data: persisted.clone(),
        });
        info!(target = "plume", event = "update", feather = %feather.name, id = %id);

        let diff = json_patch::diff(&cache_rec, &persisted);
        Ok(serde_json::to_value(diff).map_err(AppError::from)?)
    }
    .boxed()
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

/// Soft delete by default; hard delete removes the rows and the registry
/// entry. Children of `parentOf` relations go down with the parent in the
/// same transaction.
pub fn do_delete<'a, 'c: 'a>(
    conn: &'a mut SqliteConnection,
    ctx: &'a mut CrudContext<'c>,
    payload: CrudPayload,
    is_child: bool,
) -> BoxFuture<'a, AppResult<Value>> {
    async move {
        let feather = ctx.catalog.feather(conn, &payload.name).await?;
        if feather.is_child && !is_child && !ctx.is_superuser {
            return Err(AppError::validation(format!(
                "Feather {} is a child and may not be deleted directly",
                feather.name
            )));
        }
        let id = payload
            .id
            .clone()
            .ok_or_else(|| AppError::validation("Delete requires an id"))?;

        if !is_child && !ctx.is_superuser {
            let allowed = auth::is_authorized(
                conn,
                ctx.catalog,
                &AuthRequest {
                    action: "canDelete".to_string(),
                    feather: None,
                    id: Some(id.clone()),
                    folder: None,
                    user: ctx.user.clone(),
                },
            )
            .await?;
            if !allowed {
                return Err(AppError::unauthorized(format!(
                    "Not authorized to delete {}",
                    feather.name
                )));
            }
        }

        let opts = ExpandOpts {
            include_back_refs: false,
            show_deleted: false,
        };
        let old_rec = read_record(conn, ctx.catalog, &feather, &id, opts)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Record not found: {id}")))?;

        check_lock(locks::find(conn, &id).await?, payload.event_key.as_deref())?;

        // Hard deleting a folder revokes the member grants it projected.
        if feather.name == "Folder" && payload.is_hard {
            auth::propagate_auth(conn, ctx.catalog, &id, None, true).await?;
        }

        let old = old_rec.as_object().cloned().unwrap_or_default();
        for (name, prop) in &feather.properties {
            match prop.kind() {
                PropertyKind::ToMany { relation, .. } => {
                    let items = old
                        .get(name)
                        .and_then(|v| v.as_array())
                        .cloned()
                        .unwrap_or_default();
                    for item in items {
                        if let Some(child_id) = rel_id(&item) {
                            let child_payload = CrudPayload {
                                name: relation.clone(),
                                id: Some(child_id),
                                is_hard: payload.is_hard,
                                event_key: payload.event_key.clone(),
                                ..CrudPayload::default()
                            };
                            do_delete(conn, ctx, child_payload, true).await?;
                        }
                    }
                }
                PropertyKind::ToOne {
                    relation,
                    is_child: true,
                    ..
                } => {
                    if let Some(child_id) = old.get(name).and_then(rel_id) {
                        let child_payload = CrudPayload {
                            name: relation.clone(),
                            id: Some(child_id),
                            is_hard: payload.is_hard,
                            event_key: payload.event_key.clone(),
                            ..CrudPayload::default()
                        };
                        do_delete(conn, ctx, child_payload, true).await?;
                    }
                }
                _ => {}
            }
        }

        let table = quote_ident(&feather.table())?;
        if payload.is_hard {
            sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
                .bind(&id)
                .execute(&mut *conn)
                .await
                .map_err(AppError::from)?;
            if let Some((pk, _)) = tools::get_key(conn, &id).await? {
                sqlx::query("DELETE FROM _auth WHERE object_pk = ?")
                    .bind(pk)
                    .execute(&mut *conn)
                    .await
                    .map_err(AppError::from)?;
            }
            sqlx::query("DELETE FROM object WHERE id = ?")
                .bind(&id)
                .execute(&mut *conn)
                .await
                .map_err(AppError::from)?;
        } else {
            let sql = format!(
                "UPDATE {table} SET is_deleted = 1, updated = ?, updated_by = ?, etag = ? \
                 WHERE id = ?"
            );
            sqlx::query(&sql)
                .bind(now_utc())
                .bind(&ctx.user)
                .bind(new_uuid_v7())
                .bind(&id)
                .execute(&mut *conn)
                .await
                .map_err(AppError::from)?;
        }

        write_log(conn, &id, "DELETE", &ctx.user, &old_rec).await?;
        sqlx::query("DELETE FROM _lock WHERE object_id = ?")
            .bind(&id)
            .execute(&mut *conn)
            .await
            .map_err(AppError::from)?;

        ctx.changes.push(Change {
            id: id.clone(),
            feather: feather.name.clone(),
            action: "delete",
            data: old_rec,
        });
        info!(target = "plume", event = "delete", feather = %feather.name, id = %id, hard = payload.is_hard);

        Ok(Value::Bool(true))
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autonumber_pads_to_length() {
        let auto = crate::feathers::Autonumber {
            prefix: Some("ORD".into()),
            suffix: Some("X".into()),
            length: 5,
            sequence: "orders".into(),
        };
        assert_eq!(format_autonumber(&auto, 42), "ORD00042X");
        assert_eq!(format_autonumber(&auto, 123456), "ORD123456X");
    }

    #[test]
    fn rel_id_accepts_strings_and_objects() {
        assert_eq!(rel_id(&json!("abc")), Some("abc".to_string()));
        assert_eq!(rel_id(&json!({"id": "abc", "name": "x"})), Some("abc".to_string()));
        assert_eq!(rel_id(&json!(null)), None);
        assert_eq!(rel_id(&json!("")), None);
    }

    #[test]
    fn json_columns_accept_preserialized_strings() {
        assert_eq!(
            encode_json_column(&json!({"a": 1})),
            Value::String("{\"a\":1}".to_string())
        );
        assert_eq!(
            encode_json_column(&json!("[1,2]")),
            Value::String("[1,2]".to_string())
        );
    }

    #[test]
    fn foreign_lock_rejects_with_holder_name() {
        let lock = locks::Lock {
            username: "ada".into(),
            acquired: now_utc(),
            node_id: "n".into(),
            event_key: "k1".into(),
        };
        let err = check_lock(Some(lock), Some("k2")).unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.message(), "Record is locked by ada");
    }

    #[test]
    fn matching_event_key_passes_lock_check() {
        let lock = locks::Lock {
            username: "ada".into(),
            acquired: now_utc(),
            node_id: "n".into(),
            event_key: "k1".into(),
        };
        assert!(check_lock(Some(lock), Some("k1")).is_ok());
        assert!(check_lock(None, None).is_ok());
    }
}
