//! REST boundary exercised end to end through the router

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body, Bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use tb_broker::rest::router;
use tb_broker::BrokerState;

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

async fn send(
    state: &Arc<BrokerState>,
    method: Method,
    uri: &str,
    token: &str,
    body: Body,
) -> Reply {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {}", token))
        .header("Content-Type", "application/json")
        .body(body)
        .unwrap();
    let response = router(Arc::clone(state)).oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    Reply {
        status,
        headers,
        body,
    }
}

fn json_body(value: Value) -> Body {
    Body::from(value.to_string())
}

#[tokio::test]
async fn test_allocation_queue_over_rest() {
    let state = common::lab_state().await;
    let request = json!({ "groups": { "vm": ["qemu-01"] }, "endtime": "never" });

    let reply = send(&state, Method::PUT, "/allocation", "alice-token", json_body(request.clone())).await;
    assert_eq!(reply.status, StatusCode::OK);
    let alice_alloc = reply.json()["allocid"].as_str().unwrap().to_string();

    let reply = send(&state, Method::PUT, "/allocation", "bob-token", json_body(request.clone())).await;
    assert_eq!(reply.status, StatusCode::CONFLICT);
    assert_eq!(reply.json()["kind"], "busy");

    let mut queued = request.clone();
    queued["queue"] = json!(true);
    let reply = send(&state, Method::PUT, "/allocation", "bob-token", json_body(queued)).await;
    assert_eq!(reply.status, StatusCode::ACCEPTED);
    assert_eq!(reply.json()["position"], 1);
    let bob_alloc = reply.json()["allocid"].as_str().unwrap().to_string();

    // Only the owner may release
    let uri = format!("/allocation/{}", alice_alloc);
    let reply = send(&state, Method::DELETE, &uri, "bob-token", Body::empty()).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.json()["kind"], "unauthorized");

    let reply = send(&state, Method::DELETE, &uri, "alice-token", Body::empty()).await;
    assert_eq!(reply.status, StatusCode::OK);

    let uri = format!("/allocation/{}", bob_alloc);
    let reply = send(&state, Method::GET, &uri, "bob-token", Body::empty()).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["state"], "active");
}

#[tokio::test]
async fn test_power_and_console_over_rest() {
    let state = common::lab_state().await;
    let request = json!({ "groups": { "vm": ["qemu-01"] } });
    let reply = send(&state, Method::PUT, "/allocation", "alice-token", json_body(request)).await;
    assert_eq!(reply.status, StatusCode::OK);

    let reply = send(&state, Method::PUT, "/targets/qemu-01/power/on", "alice-token", Body::empty()).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["outcomes"][0]["status"], "succeeded");

    let reply = send(&state, Method::GET, "/targets/qemu-01/power/list", "bob-token", Body::empty()).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["state"], true);

    let reply = send(
        &state,
        Method::PUT,
        "/targets/qemu-01/console/write?component=ttyS0",
        "alice-token",
        Body::from("boot\n"),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);

    let reply = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let reply = send(
                &state,
                Method::GET,
                "/targets/qemu-01/console/read?component=ttyS0&offset=0",
                "alice-token",
                Body::empty(),
            )
            .await;
            if reply.body.len() == 5 {
                return reply;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(&reply.body[..], b"boot\n");
    assert_eq!(reply.headers["x-stream-size"], "5");
    let position = reply.headers["x-stream-gen-offset"].to_str().unwrap();
    assert!(position.ends_with(" 5"));
    assert_eq!(reply.headers["x-stream-offset"], "0");

    let reply = send(
        &state,
        Method::GET,
        "/targets/qemu-01/console/read?offset=-1",
        "alice-token",
        Body::empty(),
    )
    .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["kind"], "invalid_input");

    // Bob holds nothing, so he cannot touch the console
    let reply = send(
        &state,
        Method::PUT,
        "/targets/qemu-01/console/disable",
        "bob-token",
        Body::empty(),
    )
    .await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_target_admin_routes() {
    let state = common::lab_state().await;

    let reply = send(&state, Method::GET, "/targets", "bob-token", Body::empty()).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json().as_array().unwrap().len(), 3);

    let reply = send(&state, Method::PUT, "/targets/qemu-02/disable", "bob-token", Body::empty()).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);

    let reply = send(&state, Method::PUT, "/targets/qemu-02/disable", "admin-token", Body::empty()).await;
    assert_eq!(reply.status, StatusCode::OK);

    let request = json!({ "groups": { "vm": ["qemu-02"] } });
    let reply = send(&state, Method::PUT, "/allocation", "bob-token", json_body(request)).await;
    assert_eq!(reply.status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(reply.json()["kind"], "not_enabled");
}
