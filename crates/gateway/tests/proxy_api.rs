//! End-to-end proxy tests against a fake Docker daemon served over a Unix
//! socket.

#![cfg(unix)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::Path,
    http::{header::AUTHORIZATION, Request, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use common::model::{
    Endpoint, EndpointId, EndpointType, ResourceControl, ResourceType, SecurityContext,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use gateway::access::AccessControlEngine;
use gateway::app_state::AppState;
use gateway::config::{
    AgentConfig, AppConfig, HijackConfig, LimitsConfig, MetricsConfig, ServerConfig, TunnelConfig,
};
use gateway::factory::ProxyFactory;
use gateway::http::build_router;
use gateway::stores::memory::MemoryStores;
use gateway::stores::ResourceControlStore;
use gateway::tokens::TokenCacheRegistry;
use gateway::tunnel::TunnelRegistry;

const DAEMON_ID: &str = "abc";

/// Stand-in for dockerd: mutable volume inventory, no access control of its
/// own. Create really registers the name, like the daemon would.
fn fake_daemon() -> Router {
    let volumes: Arc<tokio::sync::RwLock<HashSet<String>>> = Arc::new(tokio::sync::RwLock::new(
        ["v1", "v2", "v3"].iter().map(|n| n.to_string()).collect(),
    ));
    let for_list = volumes.clone();
    let for_create = volumes.clone();
    let for_inspect = volumes;

    Router::new()
        .route("/info", get(|| async { Json(json!({"ID": DAEMON_ID})) }))
        .route(
            "/volumes",
            get(move || {
                let volumes = for_list.clone();
                async move {
                    let mut names: Vec<String> = volumes.read().await.iter().cloned().collect();
                    names.sort();
                    let listed: Vec<Value> = names
                        .iter()
                        .map(|name| json!({"Name": name, "Driver": "local"}))
                        .collect();
                    Json(json!({"Volumes": listed, "Warnings": null}))
                }
            }),
        )
        .route(
            "/volumes/create",
            post(move |Json(body): Json<Value>| {
                let volumes = for_create.clone();
                async move {
                    let name = body["Name"].as_str().unwrap_or("anonymous").to_string();
                    volumes.write().await.insert(name.clone());
                    (
                        StatusCode::CREATED,
                        Json(json!({"Name": name, "Driver": "local"})),
                    )
                }
            }),
        )
        .route(
            "/volumes/{name}",
            get(move |Path(name): Path<String>| {
                let volumes = for_inspect.clone();
                async move {
                    if volumes.read().await.contains(&name) {
                        Json(json!({"Name": name, "Driver": "local"})).into_response()
                    } else {
                        StatusCode::NOT_FOUND.into_response()
                    }
                }
            }),
        )
        .route(
            "/volumes/{name}",
            delete(|| async { StatusCode::NO_CONTENT }),
        )
        .route(
            "/containers/json",
            get(|| async { Json(json!([{"Id": "deadbeef"}])) }),
        )
}

struct Harness {
    app: Router,
    stores: MemoryStores,
    _socket_dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let socket_dir = tempfile::tempdir().expect("tempdir");
    let socket_path = socket_dir.path().join("docker.sock");

    let listener = tokio::net::UnixListener::bind(&socket_path).expect("bind unix socket");
    tokio::spawn(async move {
        axum::serve(listener, fake_daemon()).await.expect("daemon");
    });

    let stores = MemoryStores::new();
    stores
        .endpoints
        .put(Endpoint {
            id: EndpointId(1),
            name: "local".to_string(),
            endpoint_type: EndpointType::DockerLocal,
            url: String::new(),
            socket_path: Some(socket_path),
            tls: None,
        })
        .await;
    stores
        .sessions
        .register(
            "user-jwt",
            SecurityContext {
                user_id: 7,
                team_ids: vec![],
                is_admin: false,
                auth_token: "user-jwt".to_string(),
            },
        )
        .await;
    stores
        .sessions
        .register(
            "other-jwt",
            SecurityContext {
                user_id: 8,
                team_ids: vec![],
                is_admin: false,
                auth_token: "other-jwt".to_string(),
            },
        )
        .await;
    stores
        .sessions
        .register(
            "admin-jwt",
            SecurityContext {
                user_id: 1,
                team_ids: vec![],
                is_admin: true,
                auth_token: "admin-jwt".to_string(),
            },
        )
        .await;

    let config = AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        metrics: MetricsConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        tunnel: TunnelConfig {
            resolve_wait_secs: 1,
            poll_interval_ms: 50,
        },
        hijack: HijackConfig { keepalive_secs: 30 },
        limits: LimitsConfig {
            proxy_body_bytes: 2 * 1024 * 1024,
        },
        agent: AgentConfig {
            shared_secret: String::new(),
        },
    };

    let factory = ProxyFactory::new(
        stores.snapshots.clone(),
        TokenCacheRegistry::new(stores.issuer.clone()),
        TunnelRegistry::new(),
        Duration::from_secs(config.tunnel.resolve_wait_secs),
        Duration::from_millis(config.tunnel.poll_interval_ms),
        Duration::from_secs(config.hijack.keepalive_secs),
        config.agent.shared_secret.clone(),
    );
    let engine = AccessControlEngine::new(stores.controls.clone());
    let state = AppState::new(
        stores.endpoints.clone(),
        stores.sessions.clone(),
        engine,
        factory,
        &config,
        None,
    );

    Harness {
        app: build_router(state),
        stores,
        _socket_dir: socket_dir,
    }
}

fn get_request(path: &str, bearer: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header(AUTHORIZATION, format!("Bearer {bearer}"))
        .body(Body::empty())
        .unwrap()
}

fn post_request(path: &str, bearer: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(AUTHORIZATION, format!("Bearer {bearer}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete_request(path: &str, bearer: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(path)
        .header(AUTHORIZATION, format!("Bearer {bearer}"))
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn listing_filters_foreign_volumes_and_decorates_the_rest() {
    let h = harness().await;
    h.stores
        .controls
        .create(ResourceControl::private(
            format!("v2_{DAEMON_ID}"),
            ResourceType::Volume,
            99,
        ))
        .await
        .unwrap();

    let response = h
        .app
        .clone()
        .oneshot(get_request("/api/endpoints/1/docker/volumes", "user-jwt"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let volumes = body["Volumes"].as_array().unwrap();
    assert_eq!(volumes.len(), 2);
    assert_eq!(volumes[0]["Name"], "v1");
    assert_eq!(volumes[0]["ResourceID"], "v1_abc");
    assert_eq!(volumes[1]["Name"], "v3");
    assert_eq!(volumes[1]["ResourceID"], "v3_abc");
}

#[tokio::test]
async fn admins_see_every_volume() {
    let h = harness().await;
    h.stores
        .controls
        .create(ResourceControl::private(
            format!("v2_{DAEMON_ID}"),
            ResourceType::Volume,
            99,
        ))
        .await
        .unwrap();

    let response = h
        .app
        .clone()
        .oneshot(get_request("/api/endpoints/1/docker/volumes", "admin-jwt"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["Volumes"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn inspecting_a_foreign_volume_is_denied() {
    let h = harness().await;
    h.stores
        .controls
        .create(ResourceControl::private(
            format!("v2_{DAEMON_ID}"),
            ResourceType::Volume,
            99,
        ))
        .await
        .unwrap();

    let response = h
        .app
        .clone()
        .oneshot(get_request("/api/endpoints/1/docker/volumes/v2", "user-jwt"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = h
        .app
        .clone()
        .oneshot(get_request("/api/endpoints/1/docker/volumes/v1", "user-jwt"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["ResourceID"], "v1_abc");
}

#[tokio::test]
async fn creating_over_a_foreign_volume_conflicts() {
    let h = harness().await;
    h.stores
        .controls
        .create(ResourceControl::private(
            format!("v2_{DAEMON_ID}"),
            ResourceType::Volume,
            99,
        ))
        .await
        .unwrap();

    let response = h
        .app
        .clone()
        .oneshot(post_request(
            "/api/endpoints/1/docker/volumes/create",
            "user-jwt",
            json!({"Name": "v2"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn creating_a_duplicate_name_conflicts_even_without_a_control() {
    let h = harness().await;

    // v3 exists on the daemon but has no control record. Docker's create is
    // idempotent and would hand the existing volume back with 201, so the
    // gateway must refuse before the backend call.
    let response = h
        .app
        .clone()
        .oneshot(post_request(
            "/api/endpoints/1/docker/volumes/create",
            "user-jwt",
            json!({"Name": "v3"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // The refused create must not have claimed ownership of the volume.
    assert!(h
        .stores
        .controls
        .find(&format!("v3_{DAEMON_ID}"), ResourceType::Volume)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn creating_a_volume_registers_a_private_control() {
    let h = harness().await;

    let response = h
        .app
        .clone()
        .oneshot(post_request(
            "/api/endpoints/1/docker/volumes/create",
            "user-jwt",
            json!({"Name": "fresh", "Driver": "local"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = json_body(response).await;
    assert_eq!(body["ResourceID"], "fresh_abc");

    let control = h
        .stores
        .controls
        .find("fresh_abc", ResourceType::Volume)
        .await
        .unwrap()
        .expect("control");
    assert!(control.grants_access(&SecurityContext {
        user_id: 7,
        team_ids: vec![],
        is_admin: false,
        auth_token: String::new(),
    }));

    // The creator sees it; another user does not.
    let response = h
        .app
        .clone()
        .oneshot(get_request(
            "/api/endpoints/1/docker/volumes/fresh",
            "other-jwt",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn deleting_requires_access_and_drops_the_control() {
    let h = harness().await;
    h.stores
        .controls
        .create(ResourceControl::private(
            format!("v1_{DAEMON_ID}"),
            ResourceType::Volume,
            7,
        ))
        .await
        .unwrap();

    let response = h
        .app
        .clone()
        .oneshot(delete_request(
            "/api/endpoints/1/docker/volumes/v1",
            "other-jwt",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = h
        .app
        .clone()
        .oneshot(delete_request(
            "/api/endpoints/1/docker/volumes/v1",
            "user-jwt",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(h
        .stores
        .controls
        .find("v1_abc", ResourceType::Volume)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn non_volume_paths_stream_through_untouched() {
    let h = harness().await;
    let response = h
        .app
        .clone()
        .oneshot(get_request(
            "/api/endpoints/1/docker/containers/json",
            "user-jwt",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body[0]["Id"], "deadbeef");
}

#[tokio::test]
async fn requests_without_a_session_are_rejected() {
    let h = harness().await;

    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/endpoints/1/docker/volumes")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = h
        .app
        .clone()
        .oneshot(get_request("/api/endpoints/1/docker/volumes", "bogus"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_endpoints_are_not_found() {
    let h = harness().await;
    let response = h
        .app
        .clone()
        .oneshot(get_request("/api/endpoints/42/docker/volumes", "user-jwt"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_is_public() {
    let h = harness().await;
    let response = h
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
}
