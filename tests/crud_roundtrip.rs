use anyhow::Result;
use serde_json::{json, Value};

use plume_lib::{Method, Request};

#[path = "util.rs"]
mod util;

#[tokio::test]
async fn insert_returns_reconciling_patch() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;

    let body = json!({"firstName": "Ada", "lastName": "Lovelace"});
    let resp = engine
        .request(
            Request {
                method: Method::Post,
                name: "Contact".into(),
                data: body.clone(),
                ..Request::default()
            },
            false,
        )
        .await?;

    for path in ["/id", "/created", "/updated", "/createdBy", "/updatedBy", "/etag"] {
        assert!(
            util::patch_value(&resp, path).is_some(),
            "patch missing {path}: {resp}"
        );
    }
    assert_eq!(
        util::patch_value(&resp, "/isDeleted"),
        Some(&Value::Bool(false))
    );

    // Applying the patch to the request body recovers the server truth.
    let mut reconciled = body;
    let patch: json_patch::Patch = serde_json::from_value(resp.clone())?;
    json_patch::patch(&mut reconciled, &patch)?;

    let id = util::patch_value(&resp, "/id")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();
    let fetched = engine
        .request(
            Request {
                method: Method::Get,
                name: "Contact".into(),
                id: Some(id),
                ..Request::default()
            },
            false,
        )
        .await?;
    assert_eq!(fetched, reconciled);
    Ok(())
}

#[tokio::test]
async fn duplicate_natural_key_names_feather_and_value() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;

    let insert = |data: Value| {
        let engine = engine.clone();
        async move {
            engine
                .request(
                    Request {
                        method: Method::Post,
                        name: "Contact".into(),
                        data,
                        ..Request::default()
                    },
                    false,
                )
                .await
        }
    };
    insert(json!({"firstName": "Ada", "lastName": "Lovelace"})).await?;
    let err = insert(json!({"firstName": "Augusta", "lastName": "Lovelace"}))
        .await
        .expect_err("duplicate natural key must reject");
    assert_eq!(err.status_code(), 409);
    assert_eq!(
        err.message(),
        "Value 'Lovelace' assigned to Last Name on Contact is not unique to data type Contact."
    );
    Ok(())
}

#[tokio::test]
async fn patch_rotates_etag_and_stale_etag_rejects() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;

    let resp = engine
        .request(
            Request {
                method: Method::Post,
                name: "Contact".into(),
                data: json!({"firstName": "Ada", "lastName": "Lovelace"}),
                ..Request::default()
            },
            false,
        )
        .await?;
    let id = util::patch_value(&resp, "/id")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();
    let first_etag = util::patch_value(&resp, "/etag")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let patch_resp = engine
        .request(
            Request {
                method: Method::Patch,
                name: "Contact".into(),
                id: Some(id.clone()),
                data: json!([{"op": "replace", "path": "/firstName", "value": "Augusta"}]),
                ..Request::default()
            },
            false,
        )
        .await?;
    let second_etag = util::patch_value(&patch_resp, "/etag")
        .and_then(|v| v.as_str())
        .expect("patch response carries the new etag")
        .to_string();
    assert_ne!(first_etag, second_etag);
    assert!(util::patch_value(&patch_resp, "/updated").is_some());

    // Asserting the superseded etag is a conflict.
    let err = engine
        .request(
            Request {
                method: Method::Patch,
                name: "Contact".into(),
                id: Some(id),
                data: json!([
                    {"op": "replace", "path": "/etag", "value": first_etag},
                    {"op": "replace", "path": "/firstName", "value": "Byron"}
                ]),
                ..Request::default()
            },
            false,
        )
        .await
        .expect_err("stale etag must reject");
    assert_eq!(err.status_code(), 409);
    Ok(())
}

#[tokio::test]
async fn empty_patch_is_a_noop() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;

    let resp = engine
        .request(
            Request {
                method: Method::Post,
                name: "Contact".into(),
                data: json!({"firstName": "Ada", "lastName": "Lovelace"}),
                ..Request::default()
            },
            false,
        )
        .await?;
    let id = util::patch_value(&resp, "/id")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();
    let etag_before = util::patch_value(&resp, "/etag")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let noop = engine
        .request(
            Request {
                method: Method::Patch,
                name: "Contact".into(),
                id: Some(id.clone()),
                data: json!([]),
                ..Request::default()
            },
            false,
        )
        .await?;
    assert_eq!(noop, json!([]));

    let fetched = engine
        .request(
            Request {
                method: Method::Get,
                name: "Contact".into(),
                id: Some(id),
                ..Request::default()
            },
            false,
        )
        .await?;
    assert_eq!(
        fetched.get("etag").and_then(|v| v.as_str()),
        Some(etag_before.as_str())
    );
    Ok(())
}

#[tokio::test]
async fn soft_delete_hides_until_show_deleted() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;

    let resp = engine
        .request(
            Request {
                method: Method::Post,
                name: "Contact".into(),
                data: json!({"firstName": "Ada", "lastName": "Lovelace"}),
                ..Request::default()
            },
            false,
        )
        .await?;
    let id = util::patch_value(&resp, "/id")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let deleted = engine
        .request(
            Request {
                method: Method::Delete,
                name: "Contact".into(),
                id: Some(id.clone()),
                ..Request::default()
            },
            false,
        )
        .await?;
    assert_eq!(deleted, Value::Bool(true));

    let hidden = engine
        .request(
            Request {
                method: Method::Get,
                name: "Contact".into(),
                id: Some(id.clone()),
                ..Request::default()
            },
            false,
        )
        .await?;
    assert!(hidden.is_null());

    let shown = engine
        .request(
            Request {
                method: Method::Get,
                name: "Contact".into(),
                id: Some(id),
                show_deleted: true,
                ..Request::default()
            },
            false,
        )
        .await?;
    assert_eq!(shown.get("isDeleted"), Some(&Value::Bool(true)));
    Ok(())
}

#[tokio::test]
async fn upsert_downgrades_post_to_patch() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;

    let resp = engine
        .request(
            Request {
                method: Method::Post,
                name: "Contact".into(),
                data: json!({"firstName": "Ada", "lastName": "Lovelace", "age": 36}),
                ..Request::default()
            },
            false,
        )
        .await?;
    let id = util::patch_value(&resp, "/id")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    // Same id again: missing keys stay, explicit values replace.
    engine
        .request(
            Request {
                method: Method::Post,
                name: "Contact".into(),
                data: json!({"id": id, "firstName": "Augusta"}),
                ..Request::default()
            },
            false,
        )
        .await?;

    let fetched = engine
        .request(
            Request {
                method: Method::Get,
                name: "Contact".into(),
                id: Some(id),
                ..Request::default()
            },
            false,
        )
        .await?;
    assert_eq!(fetched.get("firstName"), Some(&json!("Augusta")));
    assert_eq!(fetched.get("lastName"), Some(&json!("Lovelace")));
    assert_eq!(fetched.get("age"), Some(&json!(36)));
    Ok(())
}

#[tokio::test]
async fn unknown_property_rejects() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;
    let err = engine
        .request(
            Request {
                method: Method::Post,
                name: "Contact".into(),
                data: json!({"firstName": "Ada", "shoeSize": 7}),
                ..Request::default()
            },
            false,
        )
        .await
        .expect_err("unknown property must reject");
    assert_eq!(err.status_code(), 400);
    assert!(err.message().contains("shoeSize"));
    Ok(())
}

#[tokio::test]
async fn read_only_properties_reject_client_writes() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_feather(
        &engine,
        json!({
            "name": "Gadget",
            "plural": "Gadgets",
            "properties": {
                "name": {"type": "string"},
                "serial": {"type": "string", "isReadOnly": true}
            }
        }),
    )
    .await?;

    let err = engine
        .request(
            Request {
                method: Method::Post,
                name: "Gadget".into(),
                data: json!({"name": "Engine", "serial": "SN-1"}),
                ..Request::default()
            },
            false,
        )
        .await
        .expect_err("read only property must reject on insert");
    assert_eq!(err.status_code(), 400);
    assert!(err.message().contains("Serial"));

    let resp = engine
        .request(
            Request {
                method: Method::Post,
                name: "Gadget".into(),
                data: json!({"name": "Engine"}),
                ..Request::default()
            },
            false,
        )
        .await?;
    let id = util::patch_value(&resp, "/id")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let err = engine
        .request(
            Request {
                method: Method::Patch,
                name: "Gadget".into(),
                id: Some(id.clone()),
                data: json!([{"op": "replace", "path": "/serial", "value": "SN-2"}]),
                ..Request::default()
            },
            false,
        )
        .await
        .expect_err("read only property must reject on update");
    assert_eq!(err.status_code(), 400);

    // Writable siblings still update.
    engine
        .request(
            Request {
                method: Method::Patch,
                name: "Gadget".into(),
                id: Some(id),
                data: json!([{"op": "replace", "path": "/name", "value": "Mill"}]),
                ..Request::default()
            },
            false,
        )
        .await?;
    Ok(())
}

#[tokio::test]
async fn read_records_carry_the_lock_holder() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;

    let resp = engine
        .request(
            Request {
                method: Method::Post,
                name: "Contact".into(),
                data: json!({"firstName": "Ada", "lastName": "Lovelace"}),
                ..Request::default()
            },
            false,
        )
        .await?;
    let id = util::patch_value(&resp, "/id")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let unlocked = engine
        .request(
            Request {
                method: Method::Get,
                name: "Contact".into(),
                id: Some(id.clone()),
                ..Request::default()
            },
            false,
        )
        .await?;
    assert_eq!(unlocked.get("lock"), Some(&Value::Null));

    {
        let mut conn = engine.pool.acquire().await?;
        plume_lib::locks::lock(&mut *conn, "node-1", &id, "admin", "K").await?;
    }

    let locked = engine
        .request(
            Request {
                method: Method::Get,
                name: "Contact".into(),
                id: Some(id),
                ..Request::default()
            },
            false,
        )
        .await?;
    assert_eq!(
        locked.pointer("/lock/username").and_then(|v| v.as_str()),
        Some("admin")
    );
    assert_eq!(
        locked.pointer("/lock/eventKey").and_then(|v| v.as_str()),
        Some("K")
    );
    Ok(())
}

#[tokio::test]
async fn unknown_feather_is_not_found() -> Result<()> {
    let engine = util::test_engine().await?;
    let err = engine
        .request(
            Request {
                method: Method::Post,
                name: "Phantom".into(),
                data: json!({}),
                ..Request::default()
            },
            false,
        )
        .await
        .expect_err("unknown feather must reject");
    assert_eq!(err.status_code(), 404);
    Ok(())
}
