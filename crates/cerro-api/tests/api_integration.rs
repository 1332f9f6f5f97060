//! API integration tests.
//!
//! Exercises the complete request flow (auth middleware, route-table
//! lookup, tier authorization, rate limiting, parameter binding, and the
//! query backend) against a router built from a manifest fixture on disk.

use std::io::{Seek, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tempfile::NamedTempFile;
use tower::ServiceExt;

use cerro_api::auth::ApiKeyStore;
use cerro_api::query::{MemoryBackend, Row};
use cerro_api::server::ServerBuilder;

const KEY_T0: &str = "sk_test_tier0";
const KEY_T1: &str = "sk_test_tier1";
const KEY_T2: &str = "sk_test_tier2";
const KEY_T3: &str = "sk_test_tier3";

/// Tier-laddered endpoints from the fixture manifest.
const TIERED_PATHS: [(&str, u8); 4] = [
    ("/v1/consensus/blocks", 0),
    ("/v1/execution/gas", 1),
    ("/v1/financial/fees", 2),
    ("/v1/ops/stats", 3),
];

fn fixture_manifest() -> Value {
    serde_json::json!({
        "nodes": {
            "model.cerebro.blocks": {
                "resource_type": "model",
                "name": "blocks",
                "schema": "analytics",
                "tags": ["production", "consensus", "api:blocks"],
                "columns": {
                    "date": {"data_type": "Date"},
                    "address": {"data_type": "String"},
                    "project": {"data_type": "String"},
                },
            },
            "model.cerebro.gas": {
                "resource_type": "model",
                "name": "gas",
                "schema": "analytics",
                "tags": ["production", "execution", "tier1", "api:gas"],
                "columns": {},
            },
            "model.cerebro.fees": {
                "resource_type": "model",
                "name": "fees",
                "schema": "analytics",
                "tags": ["production", "financial", "tier2", "api:fees"],
                "columns": {},
            },
            "model.cerebro.stats": {
                "resource_type": "model",
                "name": "stats",
                "schema": "analytics",
                "tags": ["production", "ops", "tier3", "api:stats"],
                "columns": {},
            },
            "model.cerebro.blob_commitments": {
                "resource_type": "model",
                "name": "blob_commitments",
                "schema": "analytics",
                "tags": ["production", "consensus", "tier1", "api:blob_commitments", "granularity:daily"],
                "columns": {},
            },
            // Missing the production tag: never exposed.
            "model.cerebro.wip": {
                "resource_type": "model",
                "name": "wip",
                "schema": "analytics",
                "tags": ["consensus", "api:wip"],
            },
            // Missing the api tag: never exposed.
            "model.cerebro.internal_only": {
                "resource_type": "model",
                "name": "internal_only",
                "schema": "analytics",
                "tags": ["production", "consensus"],
            },
        }
    })
}

fn key_store() -> ApiKeyStore {
    ApiKeyStore::from_value(&serde_json::json!({
        KEY_T0: {"user": "carol", "tier": "tier0"},
        KEY_T1: {"user": "alice", "tier": "tier1", "org": "Partner Co"},
        KEY_T2: {"user": "bob", "tier": "tier2", "org": "Premium Inc"},
        KEY_T3: {"user": "ops", "tier": "tier3"},
    }))
    .expect("build key store")
}

fn sample_row(n: i64) -> Row {
    let mut row = Row::new();
    row.insert("n".to_string(), Value::from(n));
    row
}

fn seeded_backend() -> Arc<MemoryBackend> {
    let rows: Vec<Row> = (0..3).map(sample_row).collect();
    Arc::new(
        MemoryBackend::new()
            .with_rows("analytics.blocks", rows.clone())
            .with_rows("analytics.gas", rows.clone())
            .with_rows("analytics.fees", rows.clone())
            .with_rows("analytics.stats", rows.clone())
            .with_rows("analytics.blob_commitments", rows.clone())
            .with_rows("analytics.tx", rows),
    )
}

fn write_manifest(file: &mut NamedTempFile, manifest: &Value) -> Result<()> {
    file.as_file_mut().set_len(0).context("truncate manifest")?;
    file.as_file_mut().rewind().context("rewind manifest")?;
    write!(file, "{manifest}").context("write manifest")?;
    file.as_file_mut().flush().context("flush manifest")?;
    Ok(())
}

async fn test_router_with(
    manifest: &NamedTempFile,
    backend: Arc<MemoryBackend>,
) -> Result<Router> {
    let router = ServerBuilder::new()
        .debug(true)
        .manifest_path(manifest.path())
        .key_store(key_store())
        .query_backend(backend)
        .build()
        .test_router()
        .await
        .context("build test router")?;
    Ok(router)
}

async fn fixture_router() -> Result<(Router, NamedTempFile, Arc<MemoryBackend>)> {
    let mut file = NamedTempFile::new().context("create manifest file")?;
    write_manifest(&mut file, &fixture_manifest())?;
    let backend = seeded_backend();
    let router = test_router_with(&file, Arc::clone(&backend)).await?;
    Ok((router, file, backend))
}

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    api_key: Option<&str>,
) -> Result<axum::response::Response> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = api_key {
        builder = builder.header("X-API-Key", key);
    }
    let request = builder.body(Body::empty()).context("build request")?;
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router oneshot is infallible");
    Ok(response)
}

async fn body_json(response: axum::response::Response) -> Result<Value> {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .context("read response body")?;
    serde_json::from_slice(&bytes).context("parse JSON body")
}

fn detail_of(body: &Value) -> &str {
    body.get("detail").and_then(Value::as_str).unwrap_or("")
}

#[tokio::test]
async fn root_and_health_require_no_auth() -> Result<()> {
    let (router, _manifest, _backend) = fixture_router().await?;

    let response = send(&router, Method::GET, "/", None).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["status"], "online");

    let response = send(&router, Method::GET, "/health", None).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn missing_credential_header_is_403_with_exact_detail() -> Result<()> {
    let (router, _manifest, _backend) = fixture_router().await?;

    let response = send(&router, Method::GET, "/v1/consensus/blocks", None).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await?;
    assert_eq!(
        detail_of(&body),
        "Missing authentication header: X-API-Key"
    );
    Ok(())
}

#[tokio::test]
async fn unknown_credential_is_403_with_exact_detail() -> Result<()> {
    let (router, _manifest, _backend) = fixture_router().await?;

    let response = send(
        &router,
        Method::GET,
        "/v1/consensus/blocks",
        Some("sk_not_a_key"),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await?;
    assert_eq!(detail_of(&body), "Invalid API Key");
    Ok(())
}

#[tokio::test]
async fn tier_matrix_all_sixteen_combinations() -> Result<()> {
    let (router, _manifest, _backend) = fixture_router().await?;
    let keys = [(KEY_T0, 0u8), (KEY_T1, 1), (KEY_T2, 2), (KEY_T3, 3)];

    for (key, credential_rank) in keys {
        for (path, required_rank) in TIERED_PATHS {
            let response = send(&router, Method::GET, path, Some(key)).await?;
            let expected = if credential_rank >= required_rank {
                StatusCode::OK
            } else {
                StatusCode::FORBIDDEN
            };
            assert_eq!(
                response.status(),
                expected,
                "tier{credential_rank} calling {path} (requires tier{required_rank})"
            );
        }
    }
    Ok(())
}

#[tokio::test]
async fn insufficient_tier_names_both_tiers_and_the_user() -> Result<()> {
    let (router, _manifest, _backend) = fixture_router().await?;

    let response = send(&router, Method::GET, "/v1/financial/fees", Some(KEY_T1)).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await?;
    let detail = detail_of(&body);
    assert!(detail.contains("tier2"), "{detail}");
    assert!(detail.contains("tier1"), "{detail}");
    assert!(detail.contains("alice"), "{detail}");
    Ok(())
}

#[tokio::test]
async fn twenty_first_request_in_window_is_rate_limited() -> Result<()> {
    let (router, _manifest, _backend) = fixture_router().await?;

    for i in 0..20 {
        let response = send(&router, Method::GET, "/v1/consensus/blocks", Some(KEY_T0)).await?;
        assert_eq!(response.status(), StatusCode::OK, "request {i} within budget");
    }

    let response = send(&router, Method::GET, "/v1/consensus/blocks", Some(KEY_T0)).await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    assert_eq!(response.headers()["x-ratelimit-limit"], "20");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    let body = body_json(response).await?;
    assert!(detail_of(&body).contains("Rate limit exceeded"));
    Ok(())
}

#[tokio::test]
async fn rate_budget_is_shared_across_endpoints_per_credential() -> Result<()> {
    let (router, _manifest, _backend) = fixture_router().await?;

    // Split the tier0 budget over two endpoints; the counter is keyed by
    // credential, not endpoint.
    for _ in 0..10 {
        let response = send(&router, Method::GET, "/v1/consensus/blocks", Some(KEY_T0)).await?;
        assert_eq!(response.status(), StatusCode::OK);
    }
    for _ in 0..10 {
        let response = send(
            &router,
            Method::GET,
            "/v1/consensus/blob_commitments/daily",
            Some(KEY_T0),
        )
        .await?;
        // Tier check fails before the rate counter, so the budget is untouched.
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
    for _ in 0..10 {
        let response = send(&router, Method::GET, "/v1/consensus/blocks", Some(KEY_T0)).await?;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = send(&router, Method::GET, "/v1/consensus/blocks", Some(KEY_T0)).await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    Ok(())
}

#[tokio::test]
async fn ineligible_models_are_not_routable() -> Result<()> {
    let (router, _manifest, _backend) = fixture_router().await?;

    // Missing `production` tag.
    let response = send(&router, Method::GET, "/v1/consensus/wip", Some(KEY_T3)).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await?;
    assert_eq!(detail_of(&body), "Unknown endpoint: /consensus/wip");

    // And absent from the listing.
    let response = send(&router, Method::GET, "/v1/system/routes", Some(KEY_T0)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    let listing = serde_json::to_string(&body)?;
    assert!(!listing.contains("wip"));
    assert!(!listing.contains("internal_only"));
    Ok(())
}

#[tokio::test]
async fn derived_route_metadata_round_trips() -> Result<()> {
    let (router, _manifest, _backend) = fixture_router().await?;

    let response = send(&router, Method::GET, "/v1/system/routes", Some(KEY_T0)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;

    let routes = body["routes"].as_array().context("routes array")?;
    let blob = routes
        .iter()
        .find(|r| r["path"] == "/consensus/blob_commitments/daily")
        .context("blob_commitments route present")?;
    assert_eq!(blob["group"], "consensus");
    assert_eq!(blob["tier"], "tier1");
    assert_eq!(blob["model"], "blob_commitments");

    // The derived endpoint actually serves.
    let response = send(
        &router,
        Method::GET,
        "/v1/consensus/blob_commitments/daily",
        Some(KEY_T1),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn data_endpoint_returns_row_array() -> Result<()> {
    let (router, _manifest, _backend) = fixture_router().await?;

    let response = send(&router, Method::GET, "/v1/consensus/blocks", Some(KEY_T2)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()?
        .starts_with("application/json"));
    let body = body_json(response).await?;
    let rows = body.as_array().context("rows array")?;
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["n"], 0);
    Ok(())
}

#[tokio::test]
async fn unknown_query_parameter_is_422() -> Result<()> {
    let (router, _manifest, _backend) = fixture_router().await?;

    let response = send(
        &router,
        Method::GET,
        "/v1/consensus/blocks?color=red",
        Some(KEY_T0),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await?;
    assert_eq!(detail_of(&body), "Unknown query parameter: color");
    Ok(())
}

#[tokio::test]
async fn out_of_range_limit_is_422() -> Result<()> {
    let (router, _manifest, _backend) = fixture_router().await?;

    let response = send(
        &router,
        Method::GET,
        "/v1/consensus/blocks?limit=9999",
        Some(KEY_T0),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await?;
    assert!(detail_of(&body).contains("limit must be between 1 and 5000"));
    Ok(())
}

#[tokio::test]
async fn declared_filters_reach_the_backend_as_bound_params() -> Result<()> {
    let (router, _manifest, backend) = fixture_router().await?;

    let response = send(
        &router,
        Method::GET,
        "/v1/consensus/blocks?start_date=2026-01-01&project=safe",
        Some(KEY_T0),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let executed = backend.executed();
    let query = executed.last().context("backend saw the query")?;
    assert!(query.sql.contains("date >= {p_start_date:Date}"), "{}", query.sql);
    assert!(query.sql.contains("project = {p_project:String}"), "{}", query.sql);
    assert!(query
        .params
        .contains(&("p_start_date".to_string(), "2026-01-01".to_string())));
    assert!(query
        .params
        .contains(&("p_project".to_string(), "safe".to_string())));
    Ok(())
}

#[tokio::test]
async fn manual_refresh_requires_tier3() -> Result<()> {
    let (router, _manifest, _backend) = fixture_router().await?;

    let response = send(
        &router,
        Method::POST,
        "/v1/system/manifest/refresh",
        Some(KEY_T1),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await?;
    assert!(detail_of(&body).contains("tier3"));

    let response = send(
        &router,
        Method::POST,
        "/v1/system/manifest/refresh",
        Some(KEY_T3),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["status"], "unchanged");
    Ok(())
}

#[tokio::test]
async fn manual_refresh_publishes_new_routes_without_downtime() -> Result<()> {
    let (router, mut manifest, _backend) = fixture_router().await?;

    // Not routable before the refresh.
    let response = send(&router, Method::GET, "/v1/execution/tx", Some(KEY_T3)).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let mut updated = fixture_manifest();
    updated["nodes"]["model.cerebro.tx"] = serde_json::json!({
        "resource_type": "model",
        "name": "tx",
        "schema": "analytics",
        "tags": ["production", "execution", "api:tx"],
    });
    write_manifest(&mut manifest, &updated)?;

    let response = send(
        &router,
        Method::POST,
        "/v1/system/manifest/refresh",
        Some(KEY_T3),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["status"], "reloaded");

    // New endpoint serves; old endpoints kept serving throughout.
    let response = send(&router, Method::GET, "/v1/execution/tx", Some(KEY_T3)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let response = send(&router, Method::GET, "/v1/consensus/blocks", Some(KEY_T0)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn failed_refresh_retains_the_serving_table() -> Result<()> {
    let (router, mut manifest, _backend) = fixture_router().await?;

    // Duplicate derived path: the rebuild must fail loudly...
    let mut broken = fixture_manifest();
    broken["nodes"]["model.cerebro.blocks_v2"] = serde_json::json!({
        "resource_type": "model",
        "name": "blocks_v2",
        "schema": "analytics",
        "tags": ["production", "consensus", "api:blocks"],
    });
    write_manifest(&mut manifest, &broken)?;

    let response = send(
        &router,
        Method::POST,
        "/v1/system/manifest/refresh",
        Some(KEY_T3),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["status"], "error");
    let detail = detail_of(&body);
    assert!(detail.contains("blocks") && detail.contains("blocks_v2"), "{detail}");

    // ...and the previously published table keeps serving.
    let response = send(&router, Method::GET, "/v1/consensus/blocks", Some(KEY_T0)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn unmatched_paths_outside_v1_get_json_404() -> Result<()> {
    let (router, _manifest, _backend) = fixture_router().await?;

    let response = send(&router, Method::GET, "/nope", None).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await?;
    assert_eq!(detail_of(&body), "Not Found");
    Ok(())
}
