use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use ordercore::OrderCoordinator;
use ordercore_memory::InMemoryOrderStore;
use ordercore_server::api::IDEMPOTENCY_KEY_HEADER;
use ordercore_server::{router, AppState};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tower::ServiceExt;
use tracing_test::traced_test;

fn app() -> Router {
    let coordinator = OrderCoordinator::new(InMemoryOrderStore::new());
    router(AppState::new(coordinator), Duration::from_secs(5))
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    idempotency_key: Option<&str>,
) -> (StatusCode, Value) {
    let body = body.map_or_else(Body::empty, |value| Body::from(value.to_string()));
    send_body(app, method, uri, body, idempotency_key).await
}

async fn send_body(
    app: &Router,
    method: Method,
    uri: &str,
    body: Body,
    idempotency_key: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = idempotency_key {
        builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
    }
    let request = builder.body(body).expect("request should build");

    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should not fail");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("body should be JSON")
    };
    (status, json)
}

async fn create_user(app: &Router, last_name: &str) -> i64 {
    let (status, body) = send(
        app,
        Method::POST,
        "/users",
        Some(json!({
            "first_name": "Grace",
            "last_name": last_name,
            "age": 34,
            "password": "correct horse battery",
        })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    body["id"].as_i64().expect("id should be a number")
}

async fn create_product(app: &Router, quantity: i32, price: &str) -> i64 {
    let (status, body) = send(
        app,
        Method::POST,
        "/products",
        Some(json!({
            "description": "enamel mug",
            "tags": ["Kitchen", "gift"],
            "quantity": quantity,
            "price": price,
        })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    body["id"].as_i64().expect("id should be a number")
}

async fn on_hand(app: &Router, product_id: i64) -> i64 {
    let (status, body) = send(app, Method::GET, &format!("/products/{product_id}"), None, None).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    body["quantity"].as_i64().expect("quantity should be a number")
}

fn decimal(value: &Value) -> Decimal {
    value
        .as_str()
        .expect("decimal should be serialized as a string")
        .parse()
        .expect("decimal should parse")
}

#[tokio::test]
async fn placed_order_is_readable_with_lines_and_total() {
    // Given: a buyer and a product with 5 units at 10.00
    let app = app();
    let buyer = create_user(&app, "Hopper").await;
    let product = create_product(&app, 5, "10.00").await;

    // When: the buyer orders 3 units
    let (status, created) = send(
        &app,
        Method::POST,
        "/orders",
        Some(json!({
            "user_id": buyer,
            "lines": [{"product_id": product, "quantity": 3}],
            "total_price": "30.00",
        })),
        None,
    )
    .await;

    // Then: the order exists with one line and stock dropped to 2
    assert_eq!(status, StatusCode::CREATED, "body: {created}");
    let order_id = created["id"].as_i64().expect("id should be a number");
    let (status, order) = send(&app, Method::GET, &format!("/orders/{order_id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(order["buyer"], json!(buyer));
    assert_eq!(decimal(&order["total_price"]), dec!(30));
    assert_eq!(order["lines"].as_array().map(Vec::len), Some(1));
    assert_eq!(order["lines"][0]["product_id"], json!(product));
    assert_eq!(order["lines"][0]["quantity"], json!(3));
    assert_eq!(on_hand(&app, product).await, 2);
}

#[tokio::test]
async fn insufficient_inventory_is_a_conflict_and_changes_nothing() {
    let app = app();
    let buyer = create_user(&app, "Liskov").await;
    let plenty = create_product(&app, 10, "1.00").await;
    let scarce = create_product(&app, 1, "1.00").await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/orders",
        Some(json!({
            "user_id": buyer,
            "lines": [
                {"product_id": plenty, "quantity": 4},
                {"product_id": scarce, "quantity": 2},
            ],
        })),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        body["error"],
        json!(format!(
            "insufficient inventory for product {scarce}: requested 2, available 1"
        ))
    );
    assert_eq!(on_hand(&app, plenty).await, 10);
    assert_eq!(on_hand(&app, scarce).await, 1);
}

#[tokio::test]
async fn unknown_buyer_is_not_found() {
    let app = app();
    let product = create_product(&app, 5, "1.00").await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/orders",
        Some(json!({"user_id": 999, "lines": [{"product_id": product, "quantity": 1}]})),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("buyer 999 not found"));
    assert_eq!(on_hand(&app, product).await, 5);
}

#[tokio::test]
async fn malformed_orders_are_bad_requests() {
    let app = app();
    let buyer = create_user(&app, "Dijkstra").await;
    let product = create_product(&app, 5, "1.00").await;

    let bodies = [
        json!({"user_id": buyer, "lines": []}),
        json!({"user_id": buyer, "lines": [{"product_id": product, "quantity": 0}]}),
        json!({"user_id": 0, "lines": [{"product_id": product, "quantity": 1}]}),
        json!({"user_id": buyer, "lines": [{"product_id": product, "quantity": 1}], "total_price": "-1"}),
    ];

    for body in bodies {
        let (status, response) = send(&app, Method::POST, "/orders", Some(body.clone()), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "request {body} answered {response}");
        assert!(response["error"].is_string());
    }
    assert_eq!(on_hand(&app, product).await, 5);
}

#[tokio::test]
async fn undecodable_bodies_are_json_bad_requests() {
    // Given: bodies that cannot be decoded into an order
    let app = app();
    let bodies = [
        Body::from(r#"{"user_id": 1}"#),
        Body::from(r#"{"user_id": 1, "lines": [{"product_id": 1, "quantity": 3000000000}]}"#),
        Body::from("user_id=1&product_id=1"),
    ];

    for body in bodies {
        // When
        let (status, response) = send_body(&app, Method::POST, "/orders", body, None).await;

        // Then: the usual error shape, never axum's plain-text rejection
        assert_eq!(status, StatusCode::BAD_REQUEST, "answered {response}");
        assert!(response["error"]
            .as_str()
            .is_some_and(|message| message.starts_with("invalid request body")));
    }
}

#[tokio::test]
async fn non_numeric_path_ids_are_json_bad_requests() {
    let app = app();

    for uri in ["/users/abc", "/products/abc", "/orders/abc"] {
        let (status, response) = send(&app, Method::GET, uri, None, None).await;

        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri} answered {response}");
        assert!(response["error"]
            .as_str()
            .is_some_and(|message| message.starts_with("invalid path parameter")));
    }
}

#[tokio::test]
async fn repeated_product_is_a_conflict() {
    let app = app();
    let buyer = create_user(&app, "Knuth").await;
    let product = create_product(&app, 5, "1.00").await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/orders",
        Some(json!({
            "user_id": buyer,
            "lines": [
                {"product_id": product, "quantity": 1},
                {"product_id": product, "quantity": 2},
            ],
        })),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        body["error"],
        json!(format!("product {product} appears on more than one line"))
    );
}

#[tokio::test]
async fn declared_total_mismatch_is_a_conflict() {
    let app = app();
    let buyer = create_user(&app, "Ritchie").await;
    let product = create_product(&app, 5, "10.00").await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/orders",
        Some(json!({
            "user_id": buyer,
            "lines": [{"product_id": product, "quantity": 1}],
            "total_price": "9.99",
        })),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(on_hand(&app, product).await, 5);
}

#[tokio::test]
async fn idempotency_key_header_makes_retries_safe() {
    // Given: a client that sends the same order twice with one key
    let app = app();
    let buyer = create_user(&app, "Lamport").await;
    let product = create_product(&app, 5, "2.50").await;
    let body = json!({"user_id": buyer, "lines": [{"product_id": product, "quantity": 2}]});

    // When
    let (first_status, first) =
        send(&app, Method::POST, "/orders", Some(body.clone()), Some("retry-7")).await;
    let (second_status, second) =
        send(&app, Method::POST, "/orders", Some(body), Some("retry-7")).await;

    // Then: one order, one decrement
    assert_eq!(first_status, StatusCode::CREATED);
    assert_eq!(second_status, StatusCode::CREATED);
    assert_eq!(first["id"], second["id"]);
    assert_eq!(on_hand(&app, product).await, 3);
}

#[tokio::test]
async fn blank_idempotency_key_is_rejected() {
    let app = app();
    let buyer = create_user(&app, "Hoare").await;
    let product = create_product(&app, 5, "1.00").await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/orders",
        Some(json!({"user_id": buyer, "lines": [{"product_id": product, "quantity": 1}]})),
        Some("   "),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(on_hand(&app, product).await, 5);
}

#[tokio::test]
async fn order_reads_distinguish_missing_from_invalid_ids() {
    let app = app();

    let (missing, body) = send(&app, Method::GET, "/orders/42", None, None).await;
    let (invalid, _) = send(&app, Method::GET, "/orders/0", None, None).await;

    assert_eq!(missing, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("order 42 not found"));
    assert_eq!(invalid, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn users_register_once_per_name_and_hide_passwords() {
    let app = app();
    let user_id = create_user(&app, "Turing").await;

    let (duplicate, _) = send(
        &app,
        Method::POST,
        "/users",
        Some(json!({
            "first_name": " Grace ",
            "last_name": "Turing",
            "age": 40,
            "password": "another secret",
        })),
        None,
    )
    .await;
    let (status, user) = send(&app, Method::GET, &format!("/users/{user_id}"), None, None).await;

    assert_eq!(duplicate, StatusCode::CONFLICT);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["first_name"], json!("Grace"));
    assert!(user.get("password").is_none());
}

#[tokio::test]
async fn invalid_user_fields_are_bad_requests() {
    let app = app();

    let (minor, minor_body) = send(
        &app,
        Method::POST,
        "/users",
        Some(json!({"first_name": "Kid", "last_name": "Young", "age": 12, "password": "long enough"})),
        None,
    )
    .await;
    let (short, _) = send(
        &app,
        Method::POST,
        "/users",
        Some(json!({"first_name": "Ada", "last_name": "Short", "age": 30, "password": "abc"})),
        None,
    )
    .await;

    assert_eq!(minor, StatusCode::BAD_REQUEST);
    assert!(minor_body["error"]
        .as_str()
        .is_some_and(|message| message.starts_with("age")));
    assert_eq!(short, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn restock_overwrites_quantity() {
    let app = app();
    let product = create_product(&app, 1, "3.00").await;

    let (status, body) = send(
        &app,
        Method::PUT,
        &format!("/products/{product}/quantity"),
        Some(json!({"quantity": 40})),
        None,
    )
    .await;
    let (missing, _) = send(
        &app,
        Method::PUT,
        "/products/777/quantity",
        Some(json!({"quantity": 1})),
        None,
    )
    .await;
    let (negative, _) = send(
        &app,
        Method::PUT,
        &format!("/products/{product}/quantity"),
        Some(json!({"quantity": -1})),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::NO_CONTENT, "body: {body}");
    assert_eq!(on_hand(&app, product).await, 40);
    assert_eq!(missing, StatusCode::NOT_FOUND);
    assert_eq!(negative, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn product_tags_are_normalized() {
    let app = app();
    let product = create_product(&app, 1, "3.00").await;

    let (status, body) = send(&app, Method::GET, &format!("/products/{product}"), None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tags"], json!(["gift", "kitchen"]));
    assert_eq!(decimal(&body["price"]), dec!(3));
}

#[tokio::test]
#[traced_test]
async fn every_request_is_logged_with_status() {
    let app = app();

    let _ = send(&app, Method::GET, "/orders/5", None, None).await;

    assert!(logs_contain("[http.request]"));
    assert!(logs_contain("path=/orders/5"));
    assert!(logs_contain("status=404"));
}
