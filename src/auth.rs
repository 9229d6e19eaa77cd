use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqliteConnection};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::feathers::{Catalog, PropertyKind};
use crate::tools::{self, bind_value, quote_ident, relation_column, PK};

/// Transitive role memberships for a user. The account name is itself a
/// role, and everyone is implicitly a member of `everyone`.
pub async fn user_roles(conn: &mut SqliteConnection, user: &str) -> AppResult<Vec<String>> {
    let rows = sqlx::query(
        "WITH RECURSIVE membership(role) AS (\
            SELECT role FROM role_member WHERE member = ? \
            UNION \
            SELECT rm.role FROM role_member rm JOIN membership m ON rm.member = m.role\
         ) SELECT role FROM membership",
    )
    .bind(user)
    .fetch_all(&mut *conn)
    .await
    .map_err(AppError::from)?;

    let mut roles = vec![user.to_string(), "everyone".to_string()];
    for row in rows {
        let role: String = row.get("role");
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
    Ok(roles)
}

pub async fn is_super_user(conn: &mut SqliteConnection, user: &str) -> AppResult<bool> {
    let is_super: Option<i64> =
        sqlx::query_scalar("SELECT is_super FROM user_account WHERE name = ?")
            .bind(user)
            .fetch_optional(&mut *conn)
            .await
            .map_err(AppError::from)?;
    Ok(is_super.unwrap_or(0) != 0)
}

#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// `canCreate`, `canRead`, `canUpdate` or `canDelete`.
    pub action: String,
    /// Class check target; required for `canCreate`.
    pub feather: Option<String>,
    /// Object check target for the other actions.
    pub id: Option<String>,
    /// Folder an insert will place the object in.
    pub folder: Option<String>,
    pub user: String,
}

fn action_column(action: &str) -> AppResult<&'static str> {
    match action {
        "canCreate" => Ok("can_create"),
        "canRead" => Ok("can_read"),
        "canUpdate" => Ok("can_update"),
        "canDelete" => Ok("can_delete"),
        other => Err(AppError::validation(format!("Invalid action: {other}"))),
    }
}

/// Evaluate the authorization matrix for one action. Super users bypass the
/// matrix entirely.
pub async fn is_authorized(
    conn: &mut SqliteConnection,
    catalog: &Catalog,
    request: &AuthRequest,
) -> AppResult<bool> {
    if is_super_user(conn, &request.user).await? {
        return Ok(true);
    }
    let column = action_column(&request.action)?;
    let roles = user_roles(conn, &request.user).await?;

    if request.action == "canCreate" {
        let feather = request.feather.as_deref().ok_or_else(|| {
            AppError::validation("canCreate authorization requires a feather")
        })?;
        let feather_pk = catalog.feather_pk(conn, feather).await?;
        if !class_grant(conn, feather_pk, &roles, column).await? {
            return Ok(false);
        }
        if let Some(folder_id) = &request.folder {
            return member_grant(conn, folder_id, &roles, column).await;
        }
        return Ok(true);
    }

    let id = request
        .id
        .as_deref()
        .ok_or_else(|| AppError::validation("Object authorization requires an id"))?;
    let Some((_, feather_name)) = tools::get_key(conn, id).await? else {
        return Ok(false);
    };
    let feather_pk = catalog.feather_pk(conn, &feather_name).await?;

    let mut params: Vec<Value> = vec![Value::String(id.to_string())];
    let clause = tools::build_auth_sql(column, "t", &roles, feather_pk, &mut params)?;
    let sql = format!(
        "SELECT EXISTS (SELECT 1 FROM object t WHERE t.id = ? AND {clause})"
    );
    let mut query = sqlx::query_scalar::<_, i64>(&sql);
    for param in &params {
        query = match param {
            Value::String(s) => query.bind(s.clone()),
            Value::Number(n) => query.bind(n.as_i64().unwrap_or(0)),
            other => query.bind(other.to_string()),
        };
    }
    let allowed = query.fetch_one(&mut *conn).await.map_err(AppError::from)?;
    Ok(allowed != 0)
}

async fn class_grant(
    conn: &mut SqliteConnection,
    feather_pk: i64,
    roles: &[String],
    column: &str,
) -> AppResult<bool> {
    let marks: Vec<&str> = roles.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT EXISTS (SELECT 1 FROM _auth WHERE object_pk = ? AND role IN ({}) \
         AND {column} = 1)",
        marks.join(", ")
    );
    let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(feather_pk);
    for role in roles {
        query = query.bind(role.clone());
    }
    let allowed = query.fetch_one(&mut *conn).await.map_err(AppError::from)?;
    Ok(allowed != 0)
}

async fn member_grant(
    conn: &mut SqliteConnection,
    folder_id: &str,
    roles: &[String],
    column: &str,
) -> AppResult<bool> {
    let Some((folder_pk, _)) = tools::get_key(conn, folder_id).await? else {
        return Ok(false);
    };
    let marks: Vec<&str> = roles.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT EXISTS (SELECT 1 FROM _auth WHERE object_pk = ? AND role IN ({}) \
         AND is_member_auth = 1 AND {column} = 1)",
        marks.join(", ")
    );
    let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(folder_pk);
    for role in roles {
        query = query.bind(role.clone());
    }
    let allowed = query.fetch_one(&mut *conn).await.map_err(AppError::from)?;
    Ok(allowed != 0)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GrantActions {
    pub can_create: bool,
    pub can_read: bool,
    pub can_update: bool,
    pub can_delete: bool,
}

impl GrantActions {
    pub fn is_empty(&self) -> bool {
        !(self.can_create || self.can_read || self.can_update || self.can_delete)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveAuthorization {
    /// Object target; mutually exclusive with `feather`.
    pub id: Option<String>,
    /// Class target: grant on the feather's catalog row.
    pub feather: Option<String>,
    pub role: String,
    #[serde(default)]
    pub is_member_auth: bool,
    #[serde(default)]
    pub actions: GrantActions,
}

/// Upsert a grant. Clearing every action deletes the row. Member grants on a
/// folder re-propagate to its contents.
pub async fn save_authorization(
    conn: &mut SqliteConnection,
    catalog: &Catalog,
    save: &SaveAuthorization,
) -> AppResult<()> {
    let (object_pk, feather_name) = match (&save.id, &save.feather) {
        (Some(id), _) => {
            let (pk, feather) = tools::get_key(conn, id)
                .await?
                .ok_or_else(|| AppError::not_found(format!("Object not found: {id}")))?;
            (pk, feather)
        }
        (None, Some(feather)) => (catalog.feather_pk(conn, feather).await?, "_feather".to_string()),
        (None, None) => {
            return Err(AppError::validation(
                "Authorization requires an id or a feather",
            ))
        }
    };

    if save.actions.is_empty() {
        sqlx::query("DELETE FROM _auth WHERE object_pk = ? AND role = ? AND is_member_auth = ?")
            .bind(object_pk)
            .bind(&save.role)
            .bind(save.is_member_auth as i64)
            .execute(&mut *conn)
            .await
            .map_err(AppError::from)?;
    } else {
        sqlx::query(
            "INSERT INTO _auth (object_pk, role, can_create, can_read, can_update, can_delete, \
             is_member_auth, is_inherited) VALUES (?, ?, ?, ?, ?, ?, ?, 0) \
             ON CONFLICT (object_pk, role, is_member_auth) DO UPDATE SET \
             can_create = excluded.can_create, can_read = excluded.can_read, \
             can_update = excluded.can_update, can_delete = excluded.can_delete, \
             is_inherited = 0",
        )
        .bind(object_pk)
        .bind(&save.role)
        .bind(save.actions.can_create as i64)
        .bind(save.actions.can_read as i64)
        .bind(save.actions.can_update as i64)
        .bind(save.actions.can_delete as i64)
        .bind(save.is_member_auth as i64)
        .execute(&mut *conn)
        .await
        .map_err(AppError::from)?;
    }

    info!(
        target = "plume",
        event = "authorization_saved",
        role = %save.role,
        member = save.is_member_auth
    );

    if save.is_member_auth && feather_name == "Folder" {
        if let Some(id) = &save.id {
            propagate_auth(conn, catalog, id, Some(&save.role), false).await?;
        }
    }
    Ok(())
}

/// Walk a folder's contents and child folders replacing inherited member
/// grants for the role. Objects holding a direct grant for the role are stop
/// markers. With `is_deleted` the inherited grants are revoked instead.
pub fn propagate_auth<'a>(
    conn: &'a mut SqliteConnection,
    catalog: &'a Catalog,
    folder_id: &'a str,
    role: Option<&'a str>,
    is_deleted: bool,
) -> BoxFuture<'a, AppResult<()>> {
    async move {
        let Some((folder_pk, feather_name)) = tools::get_key(conn, folder_id).await? else {
            return Ok(());
        };
        if feather_name != "Folder" {
            return Err(AppError::validation(format!(
                "Object {folder_id} is not a folder"
            )));
        }

        // Member grants being propagated, narrowed to one role when given.
        let mut grants_sql =
            "SELECT role, can_create, can_read, can_update, can_delete FROM _auth \
             WHERE object_pk = ? AND is_member_auth = 1"
                .to_string();
        if role.is_some() {
            grants_sql.push_str(" AND role = ?");
        }
        let mut query = sqlx::query(&grants_sql).bind(folder_pk);
        if let Some(role) = role {
            query = query.bind(role);
        }
        let grants = query.fetch_all(&mut *conn).await.map_err(AppError::from)?;
        let grants: Vec<(String, i64, i64, i64, i64)> = grants
            .iter()
            .map(|row| {
                (
                    row.get("role"),
                    row.get("can_create"),
                    row.get("can_read"),
                    row.get("can_update"),
                    row.get("can_delete"),
                )
            })
            .collect();

        for (target_pk, is_folder) in folder_contents(conn, catalog, folder_pk).await? {
            let roles: Vec<&str> = if let Some(role) = role {
                vec![role]
            } else {
                grants.iter().map(|(r, ..)| r.as_str()).collect()
            };
            for target_role in roles {
                // Any direct grant for the role, member or plain, halts
                // propagation onto this object.
                let direct: i64 = sqlx::query_scalar(
                    "SELECT EXISTS (SELECT 1 FROM _auth WHERE object_pk = ? AND role = ? \
                     AND is_inherited = 0)",
                )
                .bind(target_pk)
                .bind(target_role)
                .fetch_one(&mut *conn)
                .await
                .map_err(AppError::from)?;
                if direct != 0 {
                    continue;
                }

                sqlx::query(
                    "DELETE FROM _auth WHERE object_pk = ? AND role = ? AND is_inherited = 1",
                )
                .bind(target_pk)
                .bind(target_role)
                .execute(&mut *conn)
                .await
                .map_err(AppError::from)?;

                if !is_deleted {
                    if let Some(grant) = grants.iter().find(|(r, ..)| r == target_role) {
                        sqlx::query(
                            "INSERT INTO _auth (object_pk, role, can_create, can_read, \
                             can_update, can_delete, is_member_auth, is_inherited) \
                             VALUES (?, ?, ?, ?, ?, ?, ?, 1) ON CONFLICT DO NOTHING",
                        )
                        .bind(target_pk)
                        .bind(&grant.0)
                        .bind(grant.1)
                        .bind(grant.2)
                        .bind(grant.3)
                        .bind(grant.4)
                        .bind(is_folder as i64)
                        .execute(&mut *conn)
                        .await
                        .map_err(AppError::from)?;
                    }
                }
            }
            if is_folder {
                let child_id: Option<String> =
                    sqlx::query_scalar("SELECT id FROM object WHERE _pk = ?")
                        .bind(target_pk)
                        .fetch_optional(&mut *conn)
                        .await
                        .map_err(AppError::from)?;
                if let Some(child_id) = child_id {
                    propagate_auth(conn, catalog, &child_id, role, is_deleted).await?;
                }
            }
        }
        Ok(())
    }
    .boxed()
}

/// Surrogate keys of objects contained in a folder: rows of any feather with
/// a to-one relation onto Folder, plus child folders.
async fn folder_contents(
    conn: &mut SqliteConnection,
    catalog: &Catalog,
    folder_pk: i64,
) -> AppResult<Vec<(i64, bool)>> {
    let mut contents = Vec::new();
    let names = catalog.names(conn).await?;
    for (name, _) in names {
        if name == "Object" {
            continue;
        }
        let feather = catalog.feather(conn, &name).await?;
        for (prop_name, prop) in &feather.properties {
            let is_folder_relation = matches!(
                prop.kind(),
                PropertyKind::ToOne { relation, .. } if relation == "Folder"
            );
            if !is_folder_relation {
                continue;
            }
            let table = quote_ident(&feather.table())?;
            let column = quote_ident(&relation_column(prop_name))?;
            let sql = format!(
                "SELECT {PK} FROM {table} WHERE {column} = ? AND is_deleted = 0"
            );
            let query = bind_value(sqlx::query(&sql), &Value::from(folder_pk));
            let rows = query.fetch_all(&mut *conn).await.map_err(AppError::from)?;
            for row in rows {
                contents.push((row.get::<i64, _>(PK), name == "Folder"));
            }
        }
    }
    Ok(contents)
}
