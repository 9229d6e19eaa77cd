use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::{json, Value};

use plume_lib::pipeline::Trigger;
use plume_lib::{Method, Request, TriggerPosition};

#[path = "util.rs"]
mod util;

#[tokio::test]
async fn before_trigger_mutates_the_effective_body() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;

    let trigger: Trigger = Arc::new(|_conn, payload| {
        Box::pin(async move {
            if let Some(obj) = payload.new_rec.as_object_mut() {
                let first = obj
                    .get("firstName")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_uppercase();
                obj.insert("firstName".into(), json!(first));
            }
            Ok(())
        })
    });
    engine
        .registry
        .register_trigger(Method::Post, "Contact", TriggerPosition::Before, trigger)?;

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
    assert_eq!(fetched.get("firstName"), Some(&json!("ADA")));
    Ok(())
}

#[tokio::test]
async fn triggers_on_ancestors_fire_for_descendants() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;
    util::save_feather(
        &engine,
        json!({
            "name": "Customer",
            "plural": "Customers",
            "inherits": "Contact",
            "properties": {"terms": {"type": "string"}}
        }),
    )
    .await?;

    let fired = Arc::new(Mutex::new(Vec::<String>::new()));
    let log = fired.clone();
    let trigger: Trigger = Arc::new(move |_conn, _payload| {
        let log = log.clone();
        Box::pin(async move {
            log.lock().unwrap().push("contact-before".into());
            Ok(())
        })
    });
    engine
        .registry
        .register_trigger(Method::Post, "Contact", TriggerPosition::Before, trigger)?;

    let log = fired.clone();
    let after: Trigger = Arc::new(move |_conn, payload| {
        let log = log.clone();
        let has_record = !payload.new_rec.is_null();
        Box::pin(async move {
            log.lock()
                .unwrap()
                .push(format!("customer-after:{has_record}"));
            Ok(())
        })
    });
    engine
        .registry
        .register_trigger(Method::Post, "Customer", TriggerPosition::After, after)?;

    engine
        .request(
            Request {
                method: Method::Post,
                name: "Customer".into(),
                data: json!({"firstName": "Ada", "lastName": "Lovelace", "terms": "NET30"}),
                ..Request::default()
            },
            false,
        )
        .await?;

    let fired = fired.lock().unwrap().clone();
    assert_eq!(fired, vec!["contact-before", "customer-after:true"]);
    Ok(())
}

#[tokio::test]
async fn trigger_error_rolls_back_the_transaction() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_contact_feather(&engine).await?;

    let trigger: Trigger = Arc::new(|_conn, _payload| {
        Box::pin(async move {
            Err(plume_lib::AppError::validation("firstName is forbidden today"))
        })
    });
    engine
        .registry
        .register_trigger(Method::Post, "Contact", TriggerPosition::Before, trigger)?;

    let err = engine
        .request(
            Request {
                method: Method::Post,
                name: "Contact".into(),
                data: json!({"firstName": "Ada", "lastName": "Lovelace"}),
                ..Request::default()
            },
            false,
        )
        .await
        .expect_err("trigger failure must fail the request");
    assert_eq!(err.status_code(), 400);

    // Nothing committed: neither the row nor its registry entry.
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contact")
        .fetch_one(&engine.pool)
        .await?;
    assert_eq!(rows, 0);
    let registry: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM object WHERE feather = 'Contact'")
            .fetch_one(&engine.pool)
            .await?;
    assert_eq!(registry, 0);
    Ok(())
}

#[tokio::test]
async fn patch_triggers_see_old_and_new_records() -> Result<()> {
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

    let seen = Arc::new(Mutex::new((Value::Null, Value::Null)));
    let capture = seen.clone();
    let trigger: Trigger = Arc::new(move |_conn, payload| {
        let capture = capture.clone();
        let old = payload.old_rec.clone();
        let new = payload.new_rec.clone();
        Box::pin(async move {
            *capture.lock().unwrap() = (old, new);
            Ok(())
        })
    });
    engine
        .registry
        .register_trigger(Method::Patch, "Contact", TriggerPosition::Before, trigger)?;

    engine
        .request(
            Request {
                method: Method::Patch,
                name: "Contact".into(),
                id: Some(id),
                data: json!([{"op": "replace", "path": "/firstName", "value": "Augusta"}]),
                ..Request::default()
            },
            false,
        )
        .await?;

    let (old, new) = seen.lock().unwrap().clone();
    assert_eq!(old.get("firstName"), Some(&json!("Ada")));
    assert_eq!(new.get("firstName"), Some(&json!("Augusta")));
    Ok(())
}

#[tokio::test]
async fn unknown_function_is_not_found() -> Result<()> {
    let engine = util::test_engine().await?;
    let err = engine
        .request(
            Request {
                method: Method::Post,
                name: "installModule".into(),
                data: json!({}),
                ..Request::default()
            },
            false,
        )
        .await
        .expect_err("unregistered function must reject");
    assert_eq!(err.status_code(), 404);
    Ok(())
}

#[tokio::test]
async fn registered_function_runs_in_a_transaction() -> Result<()> {
    let engine = util::test_engine().await?;
    engine.registry.register_function(
        Method::Post,
        "touchSequence",
        Arc::new(|conn, _request| {
            Box::pin(async move {
                sqlx::query(
                    "INSERT INTO _sequence (name, value) VALUES ('touched', 1) \
                     ON CONFLICT (name) DO UPDATE SET value = value + 1",
                )
                .execute(&mut *conn)
                .await
                .map_err(plume_lib::AppError::from)?;
                Ok(json!("ok"))
            })
        }),
    )?;

    let result = engine
        .request(
            Request {
                method: Method::Post,
                name: "touchSequence".into(),
                ..Request::default()
            },
            false,
        )
        .await?;
    assert_eq!(result, json!("ok"));

    let value: i64 = sqlx::query_scalar("SELECT value FROM _sequence WHERE name = 'touched'")
        .fetch_one(&engine.pool)
        .await?;
    assert_eq!(value, 1);
    Ok(())
}
