//! HTTP routes.
//!
//! Handlers parse request bodies into validated domain types at the edge and
//! hand them to the coordinator or the store. Every failure becomes a JSON
//! `{"error": "..."}` body with a status derived from the error's class.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{FromRequest, FromRequestParts, Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use ordercore::{
    Age, Catalog, ErrorClass, FirstName, LastName, NewProduct, NewUser, Order, OrderCoordinator,
    OrderError, OrderId, OrderRequest, OrderStore, Password, Price, Product, ProductDescription,
    ProductId, ProductTag, RequestError, StockLevel, StoreError, User, UserDirectory, UserId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tracing::{error, info, warn};

/// Header carrying the caller's idempotency key on `POST /orders`.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

/// Shared handler state.
pub struct AppState<S> {
    coordinator: Arc<OrderCoordinator<S>>,
}

impl<S> AppState<S> {
    /// Share `coordinator` across all handlers.
    pub fn new(coordinator: OrderCoordinator<S>) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
        }
    }
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
        }
    }
}

/// Build the service router over any store that provides orders, products
/// and users.
pub fn router<S>(state: AppState<S>, request_timeout: Duration) -> Router
where
    S: OrderStore + Catalog + UserDirectory + 'static,
{
    Router::new()
        .route("/users", post(create_user::<S>))
        .route("/users/{id}", get(get_user::<S>))
        .route("/products", post(create_product::<S>))
        .route("/products/{id}", get(get_product::<S>))
        .route("/products/{id}/quantity", put(set_product_quantity::<S>))
        .route("/orders", post(create_order::<S>))
        .route("/orders/{id}", get(get_order::<S>))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(log_requests))
                .layer(middleware::from_fn_with_state(
                    request_timeout,
                    enforce_request_timeout,
                )),
        )
}

// Request/response bodies

/// `POST /users` payload.
#[derive(Debug, Deserialize)]
pub struct CreateUserBody {
    pub first_name: String,
    pub last_name: String,
    pub age: i16,
    #[serde(default)]
    pub is_married: bool,
    /// Plaintext; only its salted digest is stored.
    pub password: String,
}

/// `POST /products` payload.
#[derive(Debug, Deserialize)]
pub struct CreateProductBody {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Initial stock.
    pub quantity: i32,
    /// Unit price.
    pub price: Decimal,
}

/// `PUT /products/{id}/quantity` payload.
#[derive(Debug, Deserialize)]
pub struct SetQuantityBody {
    /// New absolute stock level, not a delta.
    pub quantity: i32,
}

/// One requested line of a [`CreateOrderBody`].
#[derive(Debug, Deserialize)]
pub struct OrderLineBody {
    pub product_id: i64,
    pub quantity: i32,
}

/// `POST /orders` payload.
#[derive(Debug, Deserialize)]
pub struct CreateOrderBody {
    /// Buyer.
    pub user_id: i64,
    pub lines: Vec<OrderLineBody>,
    /// Total the caller expects to pay. Optional; the server always computes it.
    #[serde(default)]
    pub total_price: Option<Decimal>,
}

/// Id of a newly created resource.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub id: i64,
}

/// Body of every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A failed request: status plus the message sent to the client.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: INTERNAL_ERROR_MESSAGE.to_owned(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

const fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Invalid => StatusCode::BAD_REQUEST,
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
        ErrorClass::Conflict => StatusCode::CONFLICT,
        ErrorClass::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<OrderError> for ApiError {
    fn from(error: OrderError) -> Self {
        match error.class() {
            ErrorClass::Internal => Self::internal(),
            class => Self {
                status: status_for(class),
                message: error.to_string(),
            },
        }
    }
}

impl From<RequestError> for ApiError {
    fn from(error: RequestError) -> Self {
        Self::from(OrderError::from(error))
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::BuyerNotFound(_)
            | StoreError::ProductNotFound(_)
            | StoreError::OrderNotFound(_) => Self::not_found(error.to_string()),
            StoreError::DuplicateUser { .. }
            | StoreError::DuplicateLine { .. }
            | StoreError::DuplicateIdempotencyKey(_) => Self {
                status: StatusCode::CONFLICT,
                message: error.to_string(),
            },
            StoreError::LockContention { .. } => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "resource is busy, retry later".to_owned(),
            },
            StoreError::StockUnderflow { .. } | StoreError::StoreFailure { .. } => Self::internal(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(format!("invalid request body: {}", rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(format!("invalid path parameter: {}", rejection.body_text()))
    }
}

/// `Json` whose rejections are answered as [`ApiError`]s.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
struct JsonBody<T>(T);

/// `Path` whose rejections are answered as [`ApiError`]s.
#[derive(FromRequestParts)]
#[from_request(via(Path), rejection(ApiError))]
struct PathId<T>(T);

fn parse_id<T, E>(
    raw: i64,
    kind: &'static str,
    parse: impl FnOnce(i64) -> Result<T, E>,
) -> Result<T, ApiError> {
    parse(raw).map_err(|_| {
        ApiError::bad_request(RequestError::InvalidId { kind, id: raw }.to_string())
    })
}

// Handlers

async fn create_user<S>(
    State(state): State<AppState<S>>,
    JsonBody(body): JsonBody<CreateUserBody>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError>
where
    S: OrderStore + Catalog + UserDirectory + 'static,
{
    let user = NewUser {
        first_name: FirstName::try_new(body.first_name)
            .map_err(|e| ApiError::bad_request(format!("first_name: {e}")))?,
        last_name: LastName::try_new(body.last_name)
            .map_err(|e| ApiError::bad_request(format!("last_name: {e}")))?,
        age: Age::try_new(body.age).map_err(|e| ApiError::bad_request(format!("age: {e}")))?,
        is_married: body.is_married,
        password: Password::try_new(body.password)
            .map_err(|e| ApiError::bad_request(format!("password: {e}")))?,
    };

    let id = state.coordinator.store().create_user(user).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            id: id.into_inner(),
        }),
    ))
}

async fn get_user<S>(
    State(state): State<AppState<S>>,
    PathId(raw_id): PathId<i64>,
) -> Result<Json<User>, ApiError>
where
    S: OrderStore + Catalog + UserDirectory + 'static,
{
    let user_id = parse_id(raw_id, "user", UserId::try_new)?;
    state
        .coordinator
        .store()
        .find_user(user_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("user {user_id} not found")))
}

async fn create_product<S>(
    State(state): State<AppState<S>>,
    JsonBody(body): JsonBody<CreateProductBody>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError>
where
    S: OrderStore + Catalog + UserDirectory + 'static,
{
    let tags = body
        .tags
        .into_iter()
        .map(ProductTag::try_new)
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(|e| ApiError::bad_request(format!("tags: {e}")))?;
    let product = NewProduct {
        description: ProductDescription::try_new(body.description)
            .map_err(|e| ApiError::bad_request(format!("description: {e}")))?,
        tags,
        quantity: StockLevel::try_new(body.quantity)
            .map_err(|e| ApiError::bad_request(format!("quantity: {e}")))?,
        price: Price::try_new(body.price)
            .map_err(|e| ApiError::bad_request(format!("price: {e}")))?,
    };

    let id = state.coordinator.store().create_product(product).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            id: id.into_inner(),
        }),
    ))
}

async fn get_product<S>(
    State(state): State<AppState<S>>,
    PathId(raw_id): PathId<i64>,
) -> Result<Json<Product>, ApiError>
where
    S: OrderStore + Catalog + UserDirectory + 'static,
{
    let product_id = parse_id(raw_id, "product", ProductId::try_new)?;
    state
        .coordinator
        .store()
        .find_product(product_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("product {product_id} not found")))
}

async fn set_product_quantity<S>(
    State(state): State<AppState<S>>,
    PathId(raw_id): PathId<i64>,
    JsonBody(body): JsonBody<SetQuantityBody>,
) -> Result<StatusCode, ApiError>
where
    S: OrderStore + Catalog + UserDirectory + 'static,
{
    let product_id = parse_id(raw_id, "product", ProductId::try_new)?;
    let quantity = StockLevel::try_new(body.quantity)
        .map_err(|e| ApiError::bad_request(format!("quantity: {e}")))?;

    state
        .coordinator
        .store()
        .set_product_quantity(product_id, quantity)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_order<S>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    JsonBody(body): JsonBody<CreateOrderBody>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError>
where
    S: OrderStore + Catalog + UserDirectory + 'static,
{
    let lines: Vec<(i64, i32)> = body
        .lines
        .iter()
        .map(|line| (line.product_id, line.quantity))
        .collect();
    let mut request = OrderRequest::from_raw(body.user_id, &lines, body.total_price)?;

    if let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) {
        let key = value
            .to_str()
            .map_err(|_| ApiError::from(RequestError::InvalidIdempotencyKey))?;
        request = request.with_raw_idempotency_key(key)?;
    }

    let order_id = state.coordinator.create_order(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            id: order_id.into_inner(),
        }),
    ))
}

async fn get_order<S>(
    State(state): State<AppState<S>>,
    PathId(raw_id): PathId<i64>,
) -> Result<Json<Order>, ApiError>
where
    S: OrderStore + Catalog + UserDirectory + 'static,
{
    let order_id = parse_id(raw_id, "order", OrderId::try_new)?;
    Ok(Json(state.coordinator.get_order(order_id).await?))
}

// Middleware

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    if response.status().is_server_error() {
        error!(%method, %path, status, elapsed_ms, "[http.request] request failed");
    } else {
        info!(%method, %path, status, elapsed_ms, "[http.request] request handled");
    }
    response
}

async fn enforce_request_timeout(
    State(limit): State<Duration>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(
                %path,
                limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                "[http.timeout] request exceeded its time limit"
            );
            ApiError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "request timed out".to_owned(),
            }
            .into_response()
        }
    }
}
