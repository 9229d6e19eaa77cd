use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqliteConnection};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::id::new_uuid_v7;
use crate::time::now_utc;
use crate::tools::{self, column_name, money_columns, relation_column, table_name, DefaultSpec, PK};

/// A record shape defined as data. Feathers inherit single-file from
/// `Object`, which carries the system properties every object exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Feather {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plural: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub inherits: Option<String>,
    pub is_child: bool,
    pub is_system: bool,
    pub is_read_only: bool,
    pub is_fetch_on_startup: bool,
    pub properties: IndexMap<String, Property>,
}

impl Default for Feather {
    fn default() -> Self {
        Feather {
            name: String::new(),
            plural: None,
            description: String::new(),
            inherits: Some("Object".to_string()),
            is_child: false,
            is_system: false,
            is_read_only: false,
            is_fetch_on_startup: false,
            properties: IndexMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Property {
    #[serde(rename = "type")]
    pub prop_type: PropertyType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub is_required: bool,
    pub is_unique: bool,
    pub is_natural_key: bool,
    pub is_read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autonumber: Option<Autonumber>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inherited_from: Option<String>,
}

/// The `type` field is either a scalar keyword or a relation object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyType {
    Scalar(String),
    Relation(RelationType),
}

impl Default for PropertyType {
    fn default() -> Self {
        PropertyType::Scalar("string".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RelationType {
    pub relation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<String>>,
    /// Set on the child side of a 1:N; names the array property injected on
    /// the parent feather.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_of: Option<String>,
    /// Set on the parent side; names the child's back-reference property.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_of: Option<String>,
    /// Private composite owned by exactly one parent.
    pub is_child: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Autonumber {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    pub length: u32,
    pub sequence: String,
}

/// Flattened view of a property for dispatching on its storage shape.
#[derive(Debug, Clone)]
pub enum PropertyKind {
    Scalar {
        scalar: String,
        format: Option<String>,
    },
    ToOne {
        relation: String,
        is_child: bool,
        properties: Option<Vec<String>>,
    },
    /// `parentOf` marker: ordered array of children, no physical column.
    ToMany {
        relation: String,
        back_ref: String,
    },
    /// `childOf` back-reference to the owning parent.
    ChildBackRef {
        relation: String,
        parent_property: String,
    },
}

impl Property {
    pub fn kind(&self) -> PropertyKind {
        match &self.prop_type {
            PropertyType::Scalar(scalar) => PropertyKind::Scalar {
                scalar: scalar.clone(),
                format: self.format.clone(),
            },
            PropertyType::Relation(rel) => {
                if let Some(back_ref) = &rel.parent_of {
                    PropertyKind::ToMany {
                        relation: rel.relation.clone(),
                        back_ref: back_ref.clone(),
                    }
                } else if let Some(parent_property) = &rel.child_of {
                    PropertyKind::ChildBackRef {
                        relation: rel.relation.clone(),
                        parent_property: parent_property.clone(),
                    }
                } else {
                    PropertyKind::ToOne {
                        relation: rel.relation.clone(),
                        is_child: rel.is_child,
                        properties: rel.properties.clone(),
                    }
                }
            }
        }
    }

    pub fn label(&self, name: &str) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| tools::property_label(name))
    }

    fn is_money(&self) -> bool {
        matches!(&self.prop_type, PropertyType::Scalar(_)) && self.format.as_deref() == Some("money")
    }

    /// Physical columns this property occupies, with their SQL types.
    pub fn columns(&self, name: &str) -> Vec<(String, &'static str)> {
        match self.kind() {
            PropertyKind::Scalar { scalar, format } => {
                if self.is_money() {
                    let [amount, currency, effective, base] = money_columns(name);
                    vec![
                        (amount, "REAL"),
                        (currency, "TEXT"),
                        (effective, "TEXT"),
                        (base, "REAL"),
                    ]
                } else {
                    let db_type = format
                        .as_deref()
                        .and_then(|f| tools::format_info(f).map(|(t, _)| t))
                        .or_else(|| tools::type_info(&scalar).map(|(t, _)| t))
                        .unwrap_or("TEXT");
                    vec![(column_name(name), db_type)]
                }
            }
            PropertyKind::ToOne { .. } | PropertyKind::ChildBackRef { .. } => {
                vec![(relation_column(name), "INTEGER")]
            }
            PropertyKind::ToMany { .. } => Vec::new(),
        }
    }

    /// Default resolution order: property default, then format default, then
    /// type default.
    pub fn default_spec(&self) -> DefaultSpec {
        if let Some(default) = &self.default {
            if let Some(name) = default.as_str() {
                if name.ends_with("()") {
                    // Leak-free static lookup: match the known functions.
                    return match name {
                        "now()" => DefaultSpec::Function("now()"),
                        "today()" => DefaultSpec::Function("today()"),
                        "newId()" => DefaultSpec::Function("newId()"),
                        "money()" => DefaultSpec::Function("money()"),
                        _ => DefaultSpec::Literal(default.clone()),
                    };
                }
            }
            return DefaultSpec::Literal(default.clone());
        }
        if let PropertyType::Scalar(scalar) = &self.prop_type {
            if let Some(format) = &self.format {
                if let Some((_, spec)) = tools::format_info(format) {
                    return spec;
                }
            }
            if let Some((_, spec)) = tools::type_info(scalar) {
                return spec;
            }
        }
        DefaultSpec::Literal(Value::Null)
    }
}

impl Feather {
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    pub fn table(&self) -> String {
        table_name(&self.name)
    }

    /// Data columns for the flattened physical table, system columns first.
    pub fn all_columns(&self) -> Vec<(String, &'static str)> {
        let mut columns = Vec::new();
        for (name, prop) in &self.properties {
            for col in prop.columns(name) {
                columns.push(col);
            }
        }
        columns
    }
}

/// System properties every feather inherits.
const OBJECT_SPEC: &str = r#"{
    "name": "Object",
    "plural": "Objects",
    "description": "Abstract root of every record shape",
    "inherits": null,
    "isSystem": true,
    "isReadOnly": true,
    "properties": {
        "id": {"type": "string", "isReadOnly": true, "isUnique": true, "default": "newId()"},
        "created": {"type": "string", "format": "dateTime", "isReadOnly": true},
        "createdBy": {"type": "string", "isReadOnly": true},
        "updated": {"type": "string", "format": "dateTime", "isReadOnly": true},
        "updatedBy": {"type": "string", "isReadOnly": true},
        "isDeleted": {"type": "boolean", "isReadOnly": true},
        "etag": {"type": "string", "isReadOnly": true}
    }
}"#;

const FOLDER_SPEC: &str = r#"{
    "name": "Folder",
    "plural": "Folders",
    "description": "Container whose member authorizations propagate to contents",
    "isSystem": true,
    "properties": {
        "name": {"type": "string", "isRequired": true},
        "description": {"type": "string"},
        "parentFolder": {"type": {"relation": "Folder"}}
    }
}"#;

pub fn object_feather() -> Feather {
    serde_json::from_str(OBJECT_SPEC).expect("object feather spec parses")
}

struct CacheEntry {
    etag: String,
    raw: Feather,
    merged: Feather,
    pk: i64,
}

/// In-process catalog owner. Lookups revalidate against the stored etag so a
/// save on one pool connection invalidates stale copies everywhere.
#[derive(Default)]
pub struct Catalog {
    cache: Mutex<HashMap<String, CacheEntry>>,
}

#[derive(Debug, Clone)]
pub struct StoredFeather {
    pub raw: Feather,
    pub merged: Feather,
    pub etag: String,
    pub pk: i64,
    pub is_system: bool,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    /// Seed the abstract `Object` root and the `Folder` feather. Idempotent.
    pub async fn ensure_core(&self, conn: &mut SqliteConnection) -> AppResult<()> {
        let have_object: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM _feather WHERE name = 'Object'")
                .fetch_one(&mut *conn)
                .await
                .map_err(AppError::from)?;
        if have_object == 0 {
            self.insert_catalog_row(conn, &object_feather(), true).await?;
        }
        let have_folder: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM _feather WHERE name = 'Folder'")
                .fetch_one(&mut *conn)
                .await
                .map_err(AppError::from)?;
        if have_folder == 0 {
            let folder: Feather =
                serde_json::from_str(FOLDER_SPEC).map_err(AppError::from)?;
            self.save_feather_unchecked(conn, folder).await?;
        }
        Ok(())
    }

    pub async fn invalidate(&self, name: &str) {
        self.cache.lock().await.remove(name);
    }

    /// Catalog writes can change merged descriptors of descendants and
    /// relation partners, so a save drops every cached entry.
    async fn flush(&self) {
        self.cache.lock().await.clear();
    }

    /// Merged descriptor with inherited properties first.
    pub async fn feather(&self, conn: &mut SqliteConnection, name: &str) -> AppResult<Feather> {
        self.stored(conn, name)
            .await?
            .map(|s| s.merged)
            .ok_or_else(|| AppError::not_found(format!("Feather not found: {name}")))
    }

    pub async fn feather_opt(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> AppResult<Option<Feather>> {
        Ok(self.stored(conn, name).await?.map(|s| s.merged))
    }

    pub async fn feather_pk(&self, conn: &mut SqliteConnection, name: &str) -> AppResult<i64> {
        self.stored(conn, name)
            .await?
            .map(|s| s.pk)
            .ok_or_else(|| AppError::not_found(format!("Feather not found: {name}")))
    }

    /// Inheritance chain in parent-to-child order, ending with `name`.
    pub async fn chain(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> AppResult<Vec<String>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(name.to_string());
        while let Some(n) = current {
            if !seen.insert(n.clone()) {
                return Err(AppError::validation(format!(
                    "Inheritance cycle through {n}"
                )));
            }
            let stored = self
                .stored(conn, &n)
                .await?
                .ok_or_else(|| AppError::not_found(format!("Feather not found: {n}")))?;
            chain.push(n);
            current = stored.raw.inherits.clone();
        }
        chain.reverse();
        Ok(chain)
    }

    /// Every catalog entry name with its plural, for route resolution and
    /// startup fetch.
    pub async fn names(&self, conn: &mut SqliteConnection) -> AppResult<Vec<(String, Option<String>)>> {
        let rows = sqlx::query("SELECT name, spec FROM _feather ORDER BY name")
            .fetch_all(conn)
            .await
            .map_err(AppError::from)?;
        let mut names = Vec::with_capacity(rows.len());
        for row in rows {
            let spec: String = row.get("spec");
            let feather: Feather = serde_json::from_str(&spec).map_err(AppError::from)?;
            names.push((feather.name, feather.plural));
        }
        Ok(names)
    }

    pub async fn stored(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> AppResult<Option<StoredFeather>> {
        let row = sqlx::query("SELECT _pk, etag, spec, is_system FROM _feather WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await
            .map_err(AppError::from)?;
        let Some(row) = row else {
            self.cache.lock().await.remove(name);
            return Ok(None);
        };
        let etag: String = row.get("etag");
        let pk: i64 = row.get::<i64, _>("_pk");
        let is_system: i64 = row.get("is_system");

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(name) {
                if entry.etag == etag {
                    return Ok(Some(StoredFeather {
                        raw: entry.raw.clone(),
                        merged: entry.merged.clone(),
                        etag,
                        pk: entry.pk,
                        is_system: is_system != 0,
                    }));
                }
            }
        }

        let spec: String = row.get("spec");
        let raw: Feather = serde_json::from_str(&spec).map_err(AppError::from)?;
        let merged = self.merge(conn, &raw).await?;
        let mut cache = self.cache.lock().await;
        cache.insert(
            name.to_string(),
            CacheEntry {
                etag: etag.clone(),
                raw: raw.clone(),
                merged: merged.clone(),
                pk,
            },
        );
        Ok(Some(StoredFeather {
            raw,
            merged,
            etag,
            pk,
            is_system: is_system != 0,
        }))
    }

    /// Merge rule: ancestor properties first in parent-to-child order; a
    /// child redeclaration overrides in place, and `inheritedFrom` is set
    /// only on properties the child did not declare itself.
    async fn merge(
        &self,
        conn: &mut SqliteConnection,
        feather: &Feather,
    ) -> AppResult<Feather> {
        let mut ancestors: Vec<Feather> = Vec::new();
        let mut seen = HashSet::new();
        seen.insert(feather.name.clone());
        let mut current = feather.inherits.clone();
        while let Some(name) = current {
            if !seen.insert(name.clone()) {
                return Err(AppError::validation(format!(
                    "Inheritance cycle through {name}"
                )));
            }
            let row = sqlx::query("SELECT spec FROM _feather WHERE name = ?")
                .bind(&name)
                .fetch_optional(&mut *conn)
                .await
                .map_err(AppError::from)?
                .ok_or_else(|| {
                    AppError::not_found(format!("Inherited feather not found: {name}"))
                })?;
            let spec: String = row.get("spec");
            let parent: Feather = serde_json::from_str(&spec).map_err(AppError::from)?;
            current = parent.inherits.clone();
            ancestors.push(parent);
        }
        ancestors.reverse();

        let mut merged = feather.clone();
        let mut properties: IndexMap<String, Property> = IndexMap::new();
        for ancestor in &ancestors {
            for (name, prop) in &ancestor.properties {
                let mut prop = prop.clone();
                prop.inherited_from = Some(
                    prop.inherited_from
                        .clone()
                        .unwrap_or_else(|| ancestor.name.clone()),
                );
                properties.insert(name.clone(), prop);
            }
        }
        for (name, prop) in &feather.properties {
            let mut prop = prop.clone();
            prop.inherited_from = None;
            properties.insert(name.clone(), prop);
        }
        merged.properties = properties;
        Ok(merged)
    }

    /// Save a feather definition, synthesizing or altering physical storage.
    /// Idempotent; later saves diff the property set.
    pub async fn save_feather(
        &self,
        conn: &mut SqliteConnection,
        spec: Feather,
    ) -> AppResult<()> {
        if let Some(stored) = self.stored(conn, &spec.name).await? {
            if stored.is_system && stored.raw.name != "Folder" {
                return Err(AppError::validation(format!(
                    "Feather {} is read only",
                    spec.name
                )));
            }
        }
        self.save_feather_unchecked(conn, spec).await
    }

    async fn save_feather_unchecked(
        &self,
        conn: &mut SqliteConnection,
        mut spec: Feather,
    ) -> AppResult<()> {
        validate_feather_name(&spec.name)?;
        if spec.inherits.is_none() {
            spec.inherits = Some("Object".to_string());
        }

        let stored = self.stored(conn, &spec.name).await?;

        // Auto-injected parentOf markers are owned by the catalog, not the
        // caller; re-inject any the incoming spec dropped.
        if let Some(stored) = &stored {
            for (name, prop) in &stored.raw.properties {
                if matches!(prop.kind(), PropertyKind::ToMany { .. })
                    && !spec.properties.contains_key(name)
                {
                    spec.properties.insert(name.clone(), prop.clone());
                }
            }
        }

        self.validate_properties(conn, &spec).await?;

        let old_merged = stored.as_ref().map(|s| s.merged.clone());
        let new_merged = self.merge(conn, &spec).await?;

        // Physical DDL for this feather and every descendant (flattened
        // inheritance carries parent columns downward).
        if stored.is_none() {
            self.create_table(conn, &new_merged).await?;
        } else {
            let old_cols: HashMap<String, &'static str> =
                old_merged.as_ref().unwrap().all_columns().into_iter().collect();
            let new_cols: HashMap<String, &'static str> =
                new_merged.all_columns().into_iter().collect();
            let added: Vec<(String, &'static str)> = new_cols
                .iter()
                .filter(|(name, _)| !old_cols.contains_key(*name))
                .map(|(n, t)| (n.clone(), *t))
                .collect();
            let dropped: Vec<String> = old_cols
                .keys()
                .filter(|name| !new_cols.contains_key(*name))
                .cloned()
                .collect();
            if !added.is_empty() || !dropped.is_empty() {
                let descendants = self.descendants(conn, &spec.name).await?;
                for table in descendants {
                    self.alter_table(conn, &table, &added, &dropped).await?;
                }
            }
        }

        // childOf relations inject matching parentOf markers on the parent.
        self.sync_parent_markers(conn, &spec, stored.as_ref().map(|s| &s.raw))
            .await?;

        let now = now_utc();
        let etag = new_uuid_v7();
        let json = serde_json::to_string(&spec).map_err(AppError::from)?;
        if stored.is_some() {
            sqlx::query("UPDATE _feather SET spec = ?, etag = ?, updated = ? WHERE name = ?")
                .bind(&json)
                .bind(&etag)
                .bind(&now)
                .bind(&spec.name)
                .execute(&mut *conn)
                .await
                .map_err(AppError::from)?;
        } else {
            self.insert_catalog_row(conn, &spec, spec.is_system).await?;
        }

        self.flush().await;
        info!(target = "plume", event = "feather_saved", feather = %spec.name);
        Ok(())
    }

    async fn insert_catalog_row(
        &self,
        conn: &mut SqliteConnection,
        spec: &Feather,
        is_system: bool,
    ) -> AppResult<i64> {
        let now = now_utc();
        let etag = new_uuid_v7();
        let json = serde_json::to_string(spec).map_err(AppError::from)?;
        let registry = sqlx::query("INSERT INTO object (id, feather) VALUES (?, '_feather')")
            .bind(new_uuid_v7())
            .execute(&mut *conn)
            .await
            .map_err(AppError::from)?;
        let pk = registry.last_insert_rowid();
        sqlx::query(
            "INSERT INTO _feather (_pk, name, etag, spec, is_system, created, updated) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(pk)
        .bind(&spec.name)
        .bind(&etag)
        .bind(&json)
        .bind(is_system as i64)
        .bind(&now)
        .bind(&now)
        .execute(&mut *conn)
        .await
        .map_err(AppError::from)?;
        // Default class grant so members of everyone can work with the new
        // shape until an administrator narrows it.
        sqlx::query(
            "INSERT INTO _auth (object_pk, role, can_create, can_read, can_update, can_delete) \
             VALUES (?, 'everyone', 1, 1, 1, 1) ON CONFLICT DO NOTHING",
        )
        .bind(pk)
        .execute(&mut *conn)
        .await
        .map_err(AppError::from)?;
        Ok(pk)
    }

    async fn validate_properties(
        &self,
        conn: &mut SqliteConnection,
        spec: &Feather,
    ) -> AppResult<()> {
        for (name, prop) in &spec.properties {
            if name.is_empty() || name.starts_with('_') {
                return Err(AppError::validation(format!(
                    "Invalid property name: {name}"
                )));
            }
            match &prop.prop_type {
                PropertyType::Scalar(scalar) => {
                    if tools::type_info(scalar).is_none() {
                        return Err(AppError::validation(format!(
                            "Unknown type {scalar} on property {name}"
                        )));
                    }
                    if let Some(format) = &prop.format {
                        if tools::format_info(format).is_none() {
                            return Err(AppError::validation(format!(
                                "Unknown format {format} on property {name}"
                            )));
                        }
                    }
                }
                PropertyType::Relation(rel) => {
                    // Self references are resolved during this same save.
                    if rel.relation != spec.name
                        && self.stored(conn, &rel.relation).await?.is_none()
                    {
                        return Err(AppError::validation(format!(
                            "Relation {} on property {name} is not a known feather",
                            rel.relation
                        )));
                    }
                    if rel.child_of.is_some() && rel.parent_of.is_some() {
                        return Err(AppError::validation(format!(
                            "Property {name} cannot be both childOf and parentOf"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Keep parent feathers' injected `parentOf` markers in step with this
    /// feather's `childOf` declarations.
    async fn sync_parent_markers(
        &self,
        conn: &mut SqliteConnection,
        spec: &Feather,
        previous: Option<&Feather>,
    ) -> AppResult<()> {
        let child_of = |feather: &Feather| -> Vec<(String, String, String)> {
            feather
                .properties
                .iter()
                .filter_map(|(name, prop)| match prop.kind() {
                    PropertyKind::ChildBackRef {
                        relation,
                        parent_property,
                    } => Some((name.clone(), relation, parent_property)),
                    _ => None,
                })
                .collect()
        };
        let current = child_of(spec);
        let former = previous.map(child_of).unwrap_or_default();

        // Removed childOf declarations take their parent marker with them.
        for (name, relation, parent_property) in &former {
            let still_present = current
                .iter()
                .any(|(n, r, p)| n == name && r == relation && p == parent_property);
            if !still_present {
                self.remove_parent_marker(conn, relation, parent_property, &spec.name)
                    .await?;
            }
        }

        for (back_ref, relation, parent_property) in &current {
            let parent = self
                .stored(conn, relation)
                .await?
                .ok_or_else(|| {
                    AppError::not_found(format!("Feather not found: {relation}"))
                })?;
            if let Some(existing) = parent.raw.properties.get(parent_property) {
                match existing.kind() {
                    PropertyKind::ToMany {
                        relation: r,
                        back_ref: b,
                    } if r == spec.name && b == *back_ref => continue,
                    _ => {
                        return Err(AppError::validation(format!(
                            "Property {parent_property} on {relation} is already claimed"
                        )))
                    }
                }
            }
            let mut raw = parent.raw.clone();
            raw.properties.insert(
                parent_property.clone(),
                Property {
                    prop_type: PropertyType::Relation(RelationType {
                        relation: spec.name.clone(),
                        parent_of: Some(back_ref.clone()),
                        ..RelationType::default()
                    }),
                    ..Property::default()
                },
            );
            self.rewrite_spec(conn, &raw).await?;
        }
        Ok(())
    }

    async fn remove_parent_marker(
        &self,
        conn: &mut SqliteConnection,
        parent: &str,
        property: &str,
        child: &str,
    ) -> AppResult<()> {
        let Some(stored) = self.stored(conn, parent).await? else {
            return Ok(());
        };
        let mut raw = stored.raw.clone();
        let remove = raw
            .properties
            .get(property)
            .map(|p| matches!(p.kind(), PropertyKind::ToMany { relation, .. } if relation == child))
            .unwrap_or(false);
        if remove {
            raw.properties.shift_remove(property);
            self.rewrite_spec(conn, &raw).await?;
        }
        Ok(())
    }

    async fn rewrite_spec(&self, conn: &mut SqliteConnection, raw: &Feather) -> AppResult<()> {
        let json = serde_json::to_string(raw).map_err(AppError::from)?;
        sqlx::query("UPDATE _feather SET spec = ?, etag = ?, updated = ? WHERE name = ?")
            .bind(&json)
            .bind(new_uuid_v7())
            .bind(now_utc())
            .bind(&raw.name)
            .execute(&mut *conn)
            .await
            .map_err(AppError::from)?;
        self.flush().await;
        Ok(())
    }

    /// Tables of this feather and every feather inheriting from it.
    async fn descendants(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> AppResult<Vec<String>> {
        let mut tables = vec![table_name(name)];
        let rows = sqlx::query("SELECT name, spec FROM _feather")
            .fetch_all(&mut *conn)
            .await
            .map_err(AppError::from)?;
        let specs: Vec<Feather> = rows
            .iter()
            .map(|row| {
                let spec: String = row.get("spec");
                serde_json::from_str(&spec).map_err(AppError::from)
            })
            .collect::<AppResult<_>>()?;
        let mut frontier = vec![name.to_string()];
        while let Some(current) = frontier.pop() {
            for spec in &specs {
                if spec.inherits.as_deref() == Some(current.as_str()) {
                    tables.push(spec.table());
                    frontier.push(spec.name.clone());
                }
            }
        }
        Ok(tables)
    }

    async fn create_table(
        &self,
        conn: &mut SqliteConnection,
        merged: &Feather,
    ) -> AppResult<()> {
        if merged.name == "Object" {
            return Ok(());
        }
        let table = tools::quote_ident(&merged.table())?;
        let mut columns = vec![format!("{PK} INTEGER PRIMARY KEY")];
        for (name, db_type) in merged.all_columns() {
            let quoted = tools::quote_ident(&name)?;
            if name == "id" {
                columns.push("id TEXT NOT NULL UNIQUE".to_string());
            } else if name == "is_deleted" {
                columns.push("is_deleted INTEGER NOT NULL DEFAULT 0".to_string());
            } else {
                columns.push(format!("{quoted} {db_type}"));
            }
        }
        let sql = format!("CREATE TABLE {table} ({})", columns.join(", "));
        info!(target = "plume", event = "feather_ddl", sql = %sql);
        sqlx::query(&sql)
            .execute(conn)
            .await
            .map_err(AppError::from)?;
        Ok(())
    }

    async fn alter_table(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        added: &[(String, &'static str)],
        dropped: &[String],
    ) -> AppResult<()> {
        let table = tools::quote_ident(table)?;
        for (name, db_type) in added {
            let column = tools::quote_ident(name)?;
            let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {db_type}");
            info!(target = "plume", event = "feather_ddl", sql = %sql);
            sqlx::query(&sql)
                .execute(&mut *conn)
                .await
                .map_err(AppError::from)?;
        }
        for name in dropped {
            let column = tools::quote_ident(name)?;
            let sql = format!("ALTER TABLE {table} DROP COLUMN {column}");
            info!(target = "plume", event = "feather_ddl", sql = %sql);
            sqlx::query(&sql)
                .execute(&mut *conn)
                .await
                .map_err(AppError::from)?;
        }
        Ok(())
    }

    /// Drop a feather: its table, catalog row, and any parent markers that
    /// pointed at it.
    pub async fn delete_feather(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> AppResult<()> {
        let stored = self
            .stored(conn, name)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Feather not found: {name}")))?;
        if stored.is_system {
            return Err(AppError::validation(format!("Feather {name} is read only")));
        }

        let rows = sqlx::query("SELECT name, spec FROM _feather WHERE name != ?")
            .bind(name)
            .fetch_all(&mut *conn)
            .await
            .map_err(AppError::from)?;
        for row in rows {
            let spec: String = row.get("spec");
            let other: Feather = serde_json::from_str(&spec).map_err(AppError::from)?;
            if other.inherits.as_deref() == Some(name) {
                return Err(AppError::validation(format!(
                    "Feather {} inherits from {name}",
                    other.name
                )));
            }
            let mut raw = other.clone();
            let mut changed = false;
            let mut blocked: Option<String> = None;
            raw.properties.retain(|prop_name, prop| match prop.kind() {
                PropertyKind::ToMany { relation, .. } if relation == name => {
                    changed = true;
                    false
                }
                PropertyKind::ToOne { relation, .. } | PropertyKind::ChildBackRef { relation, .. }
                    if relation == name =>
                {
                    blocked = Some(prop_name.clone());
                    true
                }
                _ => true,
            });
            if let Some(prop_name) = blocked {
                return Err(AppError::validation(format!(
                    "Property {prop_name} on {} references {name}",
                    other.name
                )));
            }
            if changed {
                self.rewrite_spec(conn, &raw).await?;
            }
        }

        let table = tools::quote_ident(&table_name(name))?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&mut *conn)
            .await
            .map_err(AppError::from)?;
        sqlx::query("DELETE FROM _feather WHERE name = ?")
            .bind(name)
            .execute(&mut *conn)
            .await
            .map_err(AppError::from)?;
        sqlx::query("DELETE FROM object WHERE _pk = ?")
            .bind(stored.pk)
            .execute(&mut *conn)
            .await
            .map_err(AppError::from)?;
        sqlx::query("DELETE FROM _auth WHERE object_pk = ?")
            .bind(stored.pk)
            .execute(&mut *conn)
            .await
            .map_err(AppError::from)?;
        self.flush().await;
        info!(target = "plume", event = "feather_deleted", feather = %name);
        Ok(())
    }
}

fn validate_feather_name(name: &str) -> AppResult<()> {
    let pascal = name
        .chars()
        .next()
        .map(|c| c.is_ascii_uppercase())
        .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric());
    if pascal {
        Ok(())
    } else {
        Err(AppError::validation(format!(
            "Feather name must be PascalCase: {name}"
        )))
    }
}
