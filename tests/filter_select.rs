use anyhow::Result;
use serde_json::{json, Value};

use plume_lib::{Filter, Method, Request};

#[path = "util.rs"]
mod util;

async fn seed_contacts(engine: &plume_lib::Engine) -> Result<()> {
    util::save_contact_feather(engine).await?;
    for (first, last, age, nickname) in [
        ("Ada", "Lovelace", 36, Some("Countess")),
        ("Charles", "Babbage", 79, None),
        ("Luigi", "Menabrea", 87, None),
    ] {
        let mut data = json!({"firstName": first, "lastName": last, "age": age});
        if let Some(nickname) = nickname {
            data["nickname"] = json!(nickname);
        } else {
            data["nickname"] = Value::Null;
        }
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
            .await?;
    }
    Ok(())
}

async fn query(engine: &plume_lib::Engine, filter: Value) -> Result<Vec<Value>> {
    let filter: Filter = serde_json::from_value(filter)?;
    let result = engine
        .request(
            Request {
                method: Method::Get,
                name: "Contact".into(),
                filter: Some(filter),
                ..Request::default()
            },
            false,
        )
        .await?;
    Ok(result.as_array().cloned().unwrap_or_default())
}

fn last_names(rows: &[Value]) -> Vec<&str> {
    rows.iter()
        .filter_map(|r| r.get("lastName").and_then(|v| v.as_str()))
        .collect()
}

#[tokio::test]
async fn equality_and_comparison_operators() -> Result<()> {
    let engine = util::test_engine().await?;
    seed_contacts(&engine).await?;

    let rows = query(
        &engine,
        json!({"criteria": [{"property": "lastName", "value": "Babbage"}]}),
    )
    .await?;
    assert_eq!(last_names(&rows), vec!["Babbage"]);

    let rows = query(
        &engine,
        json!({"criteria": [{"property": "age", "operator": ">", "value": 40}],
               "sort": [{"property": "age"}]}),
    )
    .await?;
    assert_eq!(last_names(&rows), vec!["Babbage", "Menabrea"]);

    let rows = query(
        &engine,
        json!({"criteria": [{"property": "age", "operator": "<=", "value": 36}]}),
    )
    .await?;
    assert_eq!(last_names(&rows), vec!["Lovelace"]);
    Ok(())
}

#[tokio::test]
async fn in_operator_and_disjunction() -> Result<()> {
    let engine = util::test_engine().await?;
    seed_contacts(&engine).await?;

    let rows = query(
        &engine,
        json!({"criteria": [{"property": "lastName", "operator": "IN",
                             "value": ["Lovelace", "Menabrea"]}],
               "sort": [{"property": "lastName"}]}),
    )
    .await?;
    assert_eq!(last_names(&rows), vec!["Lovelace", "Menabrea"]);

    // Array property means any-of.
    let rows = query(
        &engine,
        json!({"criteria": [{"property": ["firstName", "lastName"], "value": "Ada"}]}),
    )
    .await?;
    assert_eq!(last_names(&rows), vec!["Lovelace"]);
    Ok(())
}

#[tokio::test]
async fn null_matches_only_sql_null() -> Result<()> {
    let engine = util::test_engine().await?;
    seed_contacts(&engine).await?;

    let rows = query(
        &engine,
        json!({"criteria": [{"property": "nickname", "value": null}],
               "sort": [{"property": "lastName"}]}),
    )
    .await?;
    assert_eq!(last_names(&rows), vec!["Babbage", "Menabrea"]);

    let rows = query(
        &engine,
        json!({"criteria": [{"property": "nickname", "operator": "!=", "value": null}]}),
    )
    .await?;
    assert_eq!(last_names(&rows), vec!["Lovelace"]);
    Ok(())
}

#[tokio::test]
async fn pattern_match_is_case_insensitive_with_star_variant() -> Result<()> {
    let engine = util::test_engine().await?;
    seed_contacts(&engine).await?;

    let rows = query(
        &engine,
        json!({"criteria": [{"property": "lastName", "operator": "~*", "value": "%love%"}]}),
    )
    .await?;
    assert_eq!(last_names(&rows), vec!["Lovelace"]);

    let rows = query(
        &engine,
        json!({"criteria": [{"property": "lastName", "operator": "!~*", "value": "%a%"}],
               "sort": [{"property": "lastName"}]}),
    )
    .await?;
    assert!(last_names(&rows).is_empty());
    Ok(())
}

#[tokio::test]
async fn sort_offset_and_limit() -> Result<()> {
    let engine = util::test_engine().await?;
    seed_contacts(&engine).await?;

    let rows = query(
        &engine,
        json!({"sort": [{"property": "age", "order": "DESC"}], "limit": 2}),
    )
    .await?;
    assert_eq!(last_names(&rows), vec!["Menabrea", "Babbage"]);

    let rows = query(
        &engine,
        json!({"sort": [{"property": "age", "order": "DESC"}], "limit": 2, "offset": 2}),
    )
    .await?;
    assert_eq!(last_names(&rows), vec!["Lovelace"]);

    let rows = query(&engine, json!({"limit": 0})).await?;
    assert!(rows.is_empty());
    Ok(())
}

#[tokio::test]
async fn invalid_operator_and_sort_reject() -> Result<()> {
    let engine = util::test_engine().await?;
    seed_contacts(&engine).await?;

    let filter: Filter = serde_json::from_value(
        json!({"criteria": [{"property": "lastName", "operator": "LIKE", "value": "x"}]}),
    )?;
    let err = engine
        .request(
            Request {
                method: Method::Get,
                name: "Contact".into(),
                filter: Some(filter),
                ..Request::default()
            },
            false,
        )
        .await
        .expect_err("unknown operator must reject");
    assert_eq!(err.status_code(), 400);

    let filter: Filter =
        serde_json::from_value(json!({"sort": [{"property": "age", "order": "SIDEWAYS"}]}))?;
    let err = engine
        .request(
            Request {
                method: Method::Get,
                name: "Contact".into(),
                filter: Some(filter),
                ..Request::default()
            },
            false,
        )
        .await
        .expect_err("unknown sort order must reject");
    assert_eq!(err.status_code(), 400);

    let filter: Filter = serde_json::from_value(
        json!({"criteria": [{"property": "shoeSize", "value": 7}]}),
    )?;
    let err = engine
        .request(
            Request {
                method: Method::Get,
                name: "Contact".into(),
                filter: Some(filter),
                ..Request::default()
            },
            false,
        )
        .await
        .expect_err("unknown property must reject");
    assert_eq!(err.status_code(), 400);
    Ok(())
}

#[tokio::test]
async fn dotted_paths_traverse_relations() -> Result<()> {
    let engine = util::test_engine().await?;
    util::save_feather(
        &engine,
        json!({
            "name": "Site",
            "plural": "Sites",
            "properties": {"city": {"type": "string"}}
        }),
    )
    .await?;
    util::save_feather(
        &engine,
        json!({
            "name": "Employee",
            "plural": "Employees",
            "properties": {
                "name": {"type": "string"},
                "site": {"type": {"relation": "Site"}}
            }
        }),
    )
    .await?;

    let site_resp = engine
        .request(
            Request {
                method: Method::Post,
                name: "Site".into(),
                data: json!({"city": "Turin"}),
                ..Request::default()
            },
            false,
        )
        .await?;
    let site_id = util::patch_value(&site_resp, "/id")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    for (name, site) in [("Luigi", Some(site_id.as_str())), ("Ada", None)] {
        let mut data = json!({"name": name});
        if let Some(site) = site {
            data["site"] = json!({"id": site});
        }
        engine
            .request(
                Request {
                    method: Method::Post,
                    name: "Employee".into(),
                    data,
                    ..Request::default()
                },
                false,
            )
            .await?;
    }

    let filter: Filter = serde_json::from_value(
        json!({"criteria": [{"property": "site.city", "value": "Turin"}]}),
    )?;
    let rows = engine
        .request(
            Request {
                method: Method::Get,
                name: "Employee".into(),
                filter: Some(filter),
                ..Request::default()
            },
            false,
        )
        .await?;
    let rows = rows.as_array().cloned().unwrap_or_default();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&json!("Luigi")));
    // The relation resolves to a reference with its id.
    assert_eq!(
        rows[0].pointer("/site/id").and_then(|v| v.as_str()),
        Some(site_id.as_str())
    );
    Ok(())
}
