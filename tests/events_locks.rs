use anyhow::Result;
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};

use plume_lib::events::Subscription;
use plume_lib::state::close_session;
use plume_lib::{Filter, Method, Request};

#[path = "util.rs"]
mod util;

async fn insert_contact(engine: &plume_lib::Engine, first: &str, last: &str) -> Result<String> {
    let resp = engine
        .request(
            Request {
                method: Method::Post,
                name: "Contact".into(),
                data: json!({"firstName": first, "lastName": last}),
                ..Request::default()
            },
            false,
        )
        .await?;
    Ok(util::patch_value(&resp, "/id")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string())
}

#[tokio::test]
async fn subscribed_select_streams_later_inserts() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;
    insert_contact(&engine, "Ada", "Lovelace").await?;

    let mut rx = engine.bus.listen("node-1");

    // Unconstrained query subscribes to the ids and the feather itself.
    let subscription = Subscription {
        id: "sub1".into(),
        session_id: "sess-1".into(),
        node_id: "node-1".into(),
        merge: false,
    };
    let page = engine
        .request(
            Request {
                method: Method::Get,
                name: "Contact".into(),
                filter: Some(Filter {
                    limit: Some(10),
                    ..Filter::default()
                }),
                subscription: Some(subscription),
                ..Request::default()
            },
            false,
        )
        .await?;
    assert_eq!(page.as_array().map(|a| a.len()), Some(1));

    let id = insert_contact(&engine, "Charles", "Babbage").await?;

    let envelope = timeout(Duration::from_secs(1), rx.recv()).await??;
    assert_eq!(
        envelope.pointer("/message/action"),
        Some(&json!("create"))
    );
    assert_eq!(
        envelope.pointer("/message/subscription/sessionId"),
        Some(&json!("sess-1"))
    );
    assert_eq!(
        envelope.pointer("/message/data/id").and_then(|v| v.as_str()),
        Some(id.as_str())
    );

    // The new id was adopted, so its updates stream too.
    engine
        .request(
            Request {
                method: Method::Patch,
                name: "Contact".into(),
                id: Some(id),
                data: json!([{"op": "replace", "path": "/firstName", "value": "Chas"}]),
                ..Request::default()
            },
            false,
        )
        .await?;
    let envelope = timeout(Duration::from_secs(1), rx.recv()).await??;
    assert_eq!(envelope.pointer("/message/action"), Some(&json!("update")));
    Ok(())
}

#[tokio::test]
async fn update_and_delete_notify_by_object_id() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;
    let id = insert_contact(&engine, "Ada", "Lovelace").await?;

    let mut rx = engine.bus.listen("node-9");
    let subscription = Subscription {
        id: "sub9".into(),
        session_id: "sess-9".into(),
        node_id: "node-9".into(),
        merge: false,
    };
    {
        let mut conn = engine.pool.acquire().await?;
        plume_lib::events::subscribe(&mut *conn, &subscription, &[id.clone()], None).await?;
    }

    engine
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
    let envelope = timeout(Duration::from_secs(1), rx.recv()).await??;
    assert_eq!(envelope.pointer("/message/action"), Some(&json!("delete")));
    Ok(())
}

#[tokio::test]
async fn unsubscribe_scopes() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;
    let id = insert_contact(&engine, "Ada", "Lovelace").await?;

    let mut conn = engine.pool.acquire().await?;
    for (sub, sess) in [("s1", "a"), ("s2", "a"), ("s3", "b")] {
        let subscription = Subscription {
            id: sub.into(),
            session_id: sess.into(),
            node_id: "node-1".into(),
            merge: false,
        };
        plume_lib::events::subscribe(&mut *conn, &subscription, &[id.clone()], None).await?;
    }

    // Empty id resolves without error.
    plume_lib::events::unsubscribe(
        &mut *conn,
        "",
        plume_lib::events::UnsubscribeScope::Session,
    )
    .await?;

    plume_lib::events::unsubscribe(
        &mut *conn,
        "s1",
        plume_lib::events::UnsubscribeScope::Subscription,
    )
    .await?;
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _subscription")
        .fetch_one(&mut *conn)
        .await?;
    assert_eq!(count, 2);

    plume_lib::events::unsubscribe(
        &mut *conn,
        "a",
        plume_lib::events::UnsubscribeScope::Session,
    )
    .await?;
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _subscription")
        .fetch_one(&mut *conn)
        .await?;
    assert_eq!(count, 1);

    plume_lib::events::unsubscribe(
        &mut *conn,
        "node-1",
        plume_lib::events::UnsubscribeScope::Node,
    )
    .await?;
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _subscription")
        .fetch_one(&mut *conn)
        .await?;
    assert_eq!(count, 0);
    Ok(())
}

#[tokio::test]
async fn lock_blocks_foreign_event_keys() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;
    let id = insert_contact(&engine, "Ada", "Lovelace").await?;

    // Lock through the registered function, as /do/lock does.
    let granted = engine
        .request(
            Request {
                method: Method::Post,
                name: "lock".into(),
                data: json!({"id": id, "eventKey": "K", "sessionId": "S", "nodeId": "N"}),
                ..Request::default()
            },
            false,
        )
        .await?;
    assert_eq!(granted, Value::Bool(true));

    // A second acquire under another key is refused.
    let granted = engine
        .request(
            Request {
                method: Method::Post,
                name: "lock".into(),
                data: json!({"id": id, "eventKey": "OTHER", "sessionId": "S2", "nodeId": "N"}),
                ..Request::default()
            },
            false,
        )
        .await?;
    assert_eq!(granted, Value::Bool(false));

    let err = engine
        .request(
            Request {
                method: Method::Patch,
                name: "Contact".into(),
                id: Some(id.clone()),
                data: json!([{"op": "replace", "path": "/firstName", "value": "Augusta"}]),
                event_key: Some("OTHER".into()),
                ..Request::default()
            },
            false,
        )
        .await
        .expect_err("foreign event key must reject");
    assert_eq!(err.status_code(), 409);
    assert_eq!(err.message(), "Record is locked by admin");

    // The holder's event key passes, and the lock clears with the update.
    engine
        .request(
            Request {
                method: Method::Patch,
                name: "Contact".into(),
                id: Some(id.clone()),
                data: json!([{"op": "replace", "path": "/firstName", "value": "Augusta"}]),
                event_key: Some("K".into()),
                ..Request::default()
            },
            false,
        )
        .await?;
    let mut conn = engine.pool.acquire().await?;
    assert!(plume_lib::locks::find(&mut *conn, &id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn unlock_requires_criteria_and_matches_them() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;
    let id = insert_contact(&engine, "Ada", "Lovelace").await?;

    let mut conn = engine.pool.acquire().await?;
    plume_lib::locks::lock(&mut *conn, "N", &id, "admin", "K").await?;

    let err = plume_lib::locks::unlock(&mut *conn, &plume_lib::locks::UnlockCriteria::default())
        .await
        .expect_err("empty criteria must reject");
    assert_eq!(err.status_code(), 400);

    let released = plume_lib::locks::unlock(
        &mut *conn,
        &plume_lib::locks::UnlockCriteria {
            event_key: Some("WRONG".into()),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(released, 0);

    let released = plume_lib::locks::unlock(
        &mut *conn,
        &plume_lib::locks::UnlockCriteria {
            event_key: Some("K".into()),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(released, 1);
    Ok(())
}

#[tokio::test]
async fn closing_a_session_unsubscribes_and_unlocks() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;
    let id = insert_contact(&engine, "Ada", "Lovelace").await?;

    {
        let mut conn = engine.pool.acquire().await?;
        let subscription = Subscription {
            id: "sub".into(),
            session_id: "sess-x".into(),
            node_id: "node-1".into(),
            merge: false,
        };
        plume_lib::events::subscribe(&mut *conn, &subscription, &[id.clone()], None).await?;
        plume_lib::locks::lock(&mut *conn, "node-1", &id, "admin", "K").await?;
    }

    // The route layer tracks which event keys a session locked under; the
    // close releases by event key.
    close_session(&engine, "sess-x", &["K".to_string()]).await?;

    let mut conn = engine.pool.acquire().await?;
    let subs: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM _subscription WHERE session_id = 'sess-x'")
            .fetch_one(&mut *conn)
            .await?;
    assert_eq!(subs, 0);
    assert!(plume_lib::locks::find(&mut *conn, &id).await?.is_none());
    Ok(())
}
