use std::collections::HashMap;

use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, SqliteConnection, TypeInfo, ValueRef};

use crate::error::{AppError, AppResult};
use crate::feathers::{Catalog, Feather, PropertyKind};

/// Internal surrogate key column. Never crosses the wire; `sanitize` strips
/// every underscore-prefixed key.
pub const PK: &str = "_pk";

/// Sentinel for "no relation" in to-one columns.
pub const NO_RELATION: i64 = -1;

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

pub fn to_camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

pub fn to_spinal_case(name: &str) -> String {
    to_snake_case(name).replace('_', "-")
}

pub fn spinal_to_pascal(name: &str) -> String {
    name.split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// Human label for a property: `lastName` becomes `Last Name`.
pub fn property_label(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if i == 0 {
            out.push(c.to_ascii_uppercase());
        } else if c.is_ascii_uppercase() {
            out.push(' ');
            out.push(c);
        } else {
            out.push(c);
        }
    }
    out
}

/// Identifiers reaching SQL text must be plain snake_case words. Everything
/// else is bound as a parameter.
pub fn safe_ident(name: &str) -> AppResult<&str> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if ok {
        Ok(name)
    } else {
        Err(AppError::validation(format!("Invalid identifier: {name}")))
    }
}

/// Validate and double-quote an identifier for SQL text. Runtime-named
/// tables can collide with keywords (`order`, `group`), so generated SQL
/// always quotes.
pub fn quote_ident(name: &str) -> AppResult<String> {
    safe_ident(name)?;
    Ok(format!("\"{name}\""))
}

pub fn table_name(feather: &str) -> String {
    to_snake_case(feather)
}

pub fn column_name(property: &str) -> String {
    to_snake_case(property)
}

pub fn relation_column(property: &str) -> String {
    format!("{}_pk", to_snake_case(property))
}

pub fn money_columns(property: &str) -> [String; 4] {
    let base = to_snake_case(property);
    [
        format!("{base}_amount"),
        format!("{base}_currency"),
        format!("{base}_effective"),
        format!("{base}_base_amount"),
    ]
}

// ---------------------------------------------------------------------------
// Scalar type and format tables
// ---------------------------------------------------------------------------

/// Default for a column: a literal, or a named function resolved at insert
/// time (`now()`, `today()`, `newId()`, `money()`).
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultSpec {
    Literal(Value),
    Function(&'static str),
}

pub fn type_info(scalar: &str) -> Option<(&'static str, DefaultSpec)> {
    let info = match scalar {
        "string" => ("TEXT", DefaultSpec::Literal(Value::String(String::new()))),
        "integer" => ("INTEGER", DefaultSpec::Literal(Value::from(0))),
        "number" => ("REAL", DefaultSpec::Literal(Value::from(0.0))),
        "boolean" => ("INTEGER", DefaultSpec::Literal(Value::Bool(false))),
        "object" => ("TEXT", DefaultSpec::Literal(Value::Object(Map::new()))),
        "array" => ("TEXT", DefaultSpec::Literal(Value::Array(Vec::new()))),
        _ => return None,
    };
    Some(info)
}

pub fn format_info(format: &str) -> Option<(&'static str, DefaultSpec)> {
    let info = match format {
        "date" => ("TEXT", DefaultSpec::Function("today()")),
        "dateTime" => ("TEXT", DefaultSpec::Function("now()")),
        "color" => ("TEXT", DefaultSpec::Literal(Value::String("#000000".into()))),
        "money" => ("TEXT", DefaultSpec::Function("money()")),
        "enum" | "url" | "email" | "tel" | "password" | "textArea" | "script" => {
            ("TEXT", DefaultSpec::Literal(Value::String(String::new())))
        }
        _ => return None,
    };
    Some(info)
}

// ---------------------------------------------------------------------------
// Sanitize
// ---------------------------------------------------------------------------

/// Strip internals and convert keys for the wire: drops `_`-prefixed keys,
/// snake_case becomes camelCase, arrays sanitize element-wise, strings pass
/// through untouched.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                if key.starts_with('_') {
                    continue;
                }
                out.insert(to_camel_case(key), sanitize(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Row decoding and parameter binding
// ---------------------------------------------------------------------------

pub type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

pub fn bind_value<'q>(q: SqliteQuery<'q>, v: &Value) -> SqliteQuery<'q> {
    match v {
        Value::Null => q.bind(Option::<i64>::None),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                q.bind(i)
            } else if let Some(f) = n.as_f64() {
                q.bind(f)
            } else {
                q.bind(Option::<i64>::None)
            }
        }
        Value::Bool(b) => q.bind(*b as i64),
        Value::String(s) => q.bind(s.clone()),
        _ => q.bind(v.to_string()),
    }
}

pub fn row_to_json(row: &SqliteRow) -> Map<String, Value> {
    let mut map = Map::new();
    for col in row.columns() {
        let idx = col.ordinal();
        let v = row.try_get_raw(idx).ok();
        let val = match v {
            Some(raw) => {
                if raw.is_null() {
                    Value::Null
                } else {
                    match raw.type_info().name() {
                        "INTEGER" => row
                            .try_get::<i64, _>(idx)
                            .map(Value::from)
                            .unwrap_or(Value::Null),
                        "REAL" => row
                            .try_get::<f64, _>(idx)
                            .map(Value::from)
                            .unwrap_or(Value::Null),
                        _ => row
                            .try_get::<String, _>(idx)
                            .map(Value::from)
                            .unwrap_or(Value::Null),
                    }
                }
            }
            None => Value::Null,
        };
        map.insert(col.name().to_string(), val);
    }
    map
}

// ---------------------------------------------------------------------------
// Filter compilation
// ---------------------------------------------------------------------------

const OPERATORS: &[(&str, &str)] = &[
    ("=", "="),
    ("!=", "!="),
    ("<>", "!="),
    ("<", "<"),
    (">", ">"),
    ("<=", "<="),
    (">=", ">="),
    // Pattern operators surface as GLOB/LIKE: GLOB is the case-sensitive
    // match, LIKE the case-insensitive one.
    ("~", "GLOB"),
    ("~*", "LIKE"),
    ("!~", "NOT GLOB"),
    ("!~*", "NOT LIKE"),
    ("IN", "IN"),
];

pub fn sql_operator(op: &str) -> AppResult<&'static str> {
    OPERATORS
        .iter()
        .find(|(name, _)| *name == op)
        .map(|(_, sql)| *sql)
        .ok_or_else(|| AppError::validation(format!("Invalid operator: {op}")))
}

/// Accumulates LEFT OUTER JOIN clauses for dotted property paths, each
/// relation joined at most once.
#[derive(Default)]
pub struct JoinBuilder {
    pub clauses: Vec<String>,
    aliases: HashMap<String, String>,
}

impl JoinBuilder {
    fn alias_for(&mut self, prefix: &str, clause: impl FnOnce(&str) -> String) -> String {
        if let Some(alias) = self.aliases.get(prefix) {
            return alias.clone();
        }
        let alias = format!("j{}", self.aliases.len() + 1);
        self.clauses.push(clause(&alias));
        self.aliases.insert(prefix.to_string(), alias.clone());
        alias
    }

    pub fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" {}", self.clauses.join(" "))
        }
    }
}

/// Resolve a dotted property path (`site.address.city`) to a qualified
/// column, appending the joins it needs. A path ending on a to-one relation
/// resolves to the target's `id`.
pub async fn resolve_path(
    conn: &mut SqliteConnection,
    catalog: &Catalog,
    feather: &Feather,
    path: &str,
    joins: &mut JoinBuilder,
) -> AppResult<String> {
    let mut current = feather.clone();
    let mut alias = "t".to_string();
    let mut prefix = String::new();
    let segments: Vec<&str> = path.split('.').collect();

    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        let prop = current.property(segment).ok_or_else(|| {
            AppError::validation(format!(
                "Property {segment} not found on {}",
                current.name
            ))
        })?;
        match prop.kind() {
            PropertyKind::Scalar { format, .. } => {
                if !last {
                    return Err(AppError::validation(format!(
                        "Property {segment} on {} is not a relation",
                        current.name
                    )));
                }
                if format.as_deref() == Some("money") {
                    let [amount, ..] = money_columns(segment);
                    return Ok(format!("{alias}.{}", quote_ident(&amount)?));
                }
                return Ok(format!("{alias}.{}", quote_ident(&column_name(segment))?));
            }
            PropertyKind::ToOne { relation, .. } | PropertyKind::ChildBackRef { relation, .. } => {
                let target = catalog.feather(conn, &relation).await?;
                let table = quote_ident(&table_name(&target.name))?;
                let col = quote_ident(&relation_column(segment))?;
                if !prefix.is_empty() {
                    prefix.push('.');
                }
                prefix.push_str(segment);
                let from = alias.clone();
                alias = joins.alias_for(&prefix, |a| {
                    format!("LEFT OUTER JOIN {table} {a} ON {a}.{PK} = {from}.{col}")
                });
                if last {
                    return Ok(format!("{alias}.id"));
                }
                current = target;
            }
            PropertyKind::ToMany { .. } => {
                return Err(AppError::validation(format!(
                    "Cannot filter through array property {segment} on {}",
                    current.name
                )));
            }
        }
    }
    // Unreachable: the loop always returns on the last segment.
    Err(AppError::validation(format!("Invalid property path: {path}")))
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum PropertyRef {
    One(String),
    Any(Vec<String>),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    pub property: PropertyRef,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    pub property: String,
    #[serde(default)]
    pub order: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Filter {
    pub criteria: Vec<Criterion>,
    pub sort: Vec<SortSpec>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

/// Compile filter criteria into a conjunction of predicates. Returns the SQL
/// fragment (without a leading WHERE/AND) and pushes bind parameters in
/// order.
pub async fn process_criteria(
    conn: &mut SqliteConnection,
    catalog: &Catalog,
    feather: &Feather,
    criteria: &[Criterion],
    joins: &mut JoinBuilder,
    params: &mut Vec<Value>,
) -> AppResult<String> {
    let mut clauses = Vec::new();
    for criterion in criteria {
        let op = sql_operator(criterion.operator.as_deref().unwrap_or("="))?;
        let properties: Vec<&str> = match &criterion.property {
            PropertyRef::One(p) => vec![p.as_str()],
            PropertyRef::Any(ps) => ps.iter().map(|p| p.as_str()).collect(),
        };
        if properties.is_empty() {
            return Err(AppError::validation("Criterion has no property"));
        }
        let mut branches = Vec::new();
        for property in properties {
            let column = resolve_path(conn, catalog, feather, property, joins).await?;
            branches.push(compile_predicate(&column, op, &criterion.value, params)?);
        }
        if branches.len() == 1 {
            clauses.push(branches.remove(0));
        } else {
            clauses.push(format!("({})", branches.join(" OR ")));
        }
    }
    Ok(clauses.join(" AND "))
}

fn compile_predicate(
    column: &str,
    op: &'static str,
    value: &Value,
    params: &mut Vec<Value>,
) -> AppResult<String> {
    if op == "IN" {
        let items = value.as_array().ok_or_else(|| {
            AppError::validation("IN operator requires an array value")
        })?;
        if items.is_empty() {
            return Ok("1 = 0".to_string());
        }
        let placeholders: Vec<&str> = items.iter().map(|_| "?").collect();
        params.extend(items.iter().cloned());
        return Ok(format!("{column} IN ({})", placeholders.join(", ")));
    }
    if value.is_null() {
        return match op {
            "=" => Ok(format!("{column} IS NULL")),
            "!=" => Ok(format!("{column} IS NOT NULL")),
            _ => Err(AppError::validation(format!(
                "Operator {op} cannot compare against null"
            ))),
        };
    }
    params.push(value.clone());
    Ok(format!("{column} {op} ?"))
}

/// Compile the sort list to an ORDER BY body, `_pk` appended as the final
/// tiebreaker so result order is total.
pub async fn process_sort(
    conn: &mut SqliteConnection,
    catalog: &Catalog,
    feather: &Feather,
    sort: &[SortSpec],
    joins: &mut JoinBuilder,
) -> AppResult<String> {
    let mut parts = Vec::with_capacity(sort.len() + 1);
    for spec in sort {
        let direction = match spec.order.as_deref() {
            None => "ASC",
            Some(o) if o.eq_ignore_ascii_case("ASC") => "ASC",
            Some(o) if o.eq_ignore_ascii_case("DESC") => "DESC",
            Some(other) => {
                return Err(AppError::validation(format!(
                    "Invalid sort order: {other}"
                )))
            }
        };
        let column = resolve_path(conn, catalog, feather, &spec.property, joins).await?;
        parts.push(format!("{column} {direction}"));
    }
    parts.push(format!("t.{PK}"));
    Ok(parts.join(", "))
}

// ---------------------------------------------------------------------------
// Authorization clause
// ---------------------------------------------------------------------------

const AUTH_ACTIONS: &[&str] = &["can_read", "can_update", "can_delete"];

/// WHERE fragment restricting rows to those the caller's roles may act on.
/// Object-level direct grants take precedence over inherited grants, which
/// take precedence over class-level grants on the feather's catalog row;
/// within a tier the most permissive grant wins.
pub fn build_auth_sql(
    action: &str,
    alias: &str,
    roles: &[String],
    feather_pk: i64,
    params: &mut Vec<Value>,
) -> AppResult<String> {
    if !AUTH_ACTIONS.contains(&action) {
        return Err(AppError::validation(format!("Invalid auth action: {action}")));
    }
    let role_list = |params: &mut Vec<Value>| -> String {
        let marks: Vec<&str> = roles.iter().map(|_| "?").collect();
        params.extend(roles.iter().map(|r| Value::String(r.clone())));
        marks.join(", ")
    };

    let direct_allow = format!(
        "EXISTS (SELECT 1 FROM _auth a WHERE a.object_pk = {alias}.{PK} \
         AND a.is_inherited = 0 AND a.role IN ({}) AND a.{action} = 1)",
        role_list(params)
    );
    let direct_any = format!(
        "EXISTS (SELECT 1 FROM _auth a WHERE a.object_pk = {alias}.{PK} \
         AND a.is_inherited = 0 AND a.role IN ({}))",
        role_list(params)
    );
    let inherited_allow = format!(
        "EXISTS (SELECT 1 FROM _auth a WHERE a.object_pk = {alias}.{PK} \
         AND a.is_inherited = 1 AND a.role IN ({}) AND a.{action} = 1)",
        role_list(params)
    );
    let inherited_any = format!(
        "EXISTS (SELECT 1 FROM _auth a WHERE a.object_pk = {alias}.{PK} \
         AND a.is_inherited = 1 AND a.role IN ({}))",
        role_list(params)
    );
    let class_allow = format!(
        "EXISTS (SELECT 1 FROM _auth a WHERE a.object_pk = ? \
         AND a.role IN ({}) AND a.{action} = 1)",
        {
            params.push(Value::from(feather_pk));
            role_list(params)
        }
    );

    Ok(format!(
        "({direct_allow} OR (NOT {direct_any} AND ({inherited_allow} \
         OR (NOT {inherited_any} AND {class_allow}))))"
    ))
}

// ---------------------------------------------------------------------------
// Key lookup
// ---------------------------------------------------------------------------

/// Resolve a logical id to its surrogate key and owning feather through the
/// object registry.
pub async fn get_key(
    conn: &mut SqliteConnection,
    id: &str,
) -> AppResult<Option<(i64, String)>> {
    let row = sqlx::query("SELECT _pk, feather FROM object WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(AppError::from)?;
    Ok(row.map(|r| (r.get::<i64, _>("_pk"), r.get::<String, _>("feather"))))
}

pub async fn get_keys(
    conn: &mut SqliteConnection,
    ids: &[String],
) -> AppResult<Vec<(i64, String)>> {
    let mut keys = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(key) = get_key(conn, id).await? {
            keys.push(key);
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snake_and_camel_round_trip() {
        assert_eq!(to_snake_case("firstName"), "first_name");
        assert_eq!(to_snake_case("OrderLine"), "order_line");
        assert_eq!(to_camel_case("first_name"), "firstName");
        assert_eq!(to_spinal_case("OrderLine"), "order-line");
        assert_eq!(spinal_to_pascal("order-line"), "OrderLine");
    }

    #[test]
    fn labels_read_like_titles() {
        assert_eq!(property_label("lastName"), "Last Name");
        assert_eq!(property_label("name"), "Name");
    }

    #[test]
    fn safe_ident_rejects_injection() {
        assert!(safe_ident("order_line").is_ok());
        assert!(safe_ident("order;drop").is_err());
        assert!(safe_ident("Order").is_err());
        assert!(safe_ident("").is_err());
    }

    #[test]
    fn sanitize_strips_internals_and_camelizes() {
        let value = json!({
            "_pk": 7,
            "first_name": "Ada",
            "line_items": [{"_pk": 8, "unit_price": 2}],
        });
        let clean = sanitize(&value);
        assert_eq!(
            clean,
            json!({"firstName": "Ada", "lineItems": [{"unitPrice": 2}]})
        );
    }

    #[test]
    fn unknown_operator_is_invalid_argument() {
        let err = sql_operator("LIKE").unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.message().contains("Invalid operator"));
    }

    #[test]
    fn null_equality_compiles_to_is_null() {
        let mut params = Vec::new();
        let sql = compile_predicate("t.name", "=", &Value::Null, &mut params).unwrap();
        assert_eq!(sql, "t.name IS NULL");
        assert!(params.is_empty());
    }

    #[test]
    fn in_operator_expands_placeholders() {
        let mut params = Vec::new();
        let sql =
            compile_predicate("t.name", "IN", &json!(["a", "b"]), &mut params).unwrap();
        assert_eq!(sql, "t.name IN (?, ?)");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn empty_in_matches_nothing() {
        let mut params = Vec::new();
        let sql = compile_predicate("t.name", "IN", &json!([]), &mut params).unwrap();
        assert_eq!(sql, "1 = 0");
    }

    #[test]
    fn auth_sql_validates_action() {
        let mut params = Vec::new();
        let err = build_auth_sql("can_create", "t", &["everyone".into()], 1, &mut params)
            .unwrap_err();
        assert!(err.message().contains("Invalid auth action"));
    }

    #[test]
    fn auth_sql_binds_roles_per_tier() {
        let mut params = Vec::new();
        let roles = vec!["admin".to_string(), "everyone".to_string()];
        let sql = build_auth_sql("can_read", "t", &roles, 42, &mut params).unwrap();
        // Five role lists bound, plus the feather pk.
        assert_eq!(params.len(), 5 * roles.len() + 1);
        assert!(sql.contains("a.can_read = 1"));
    }
}
