//! PostgreSQL adapter for the `OrderCore` order placement library
//!
//! A unit of work is one database transaction. Product rows are locked with
//! `SELECT ... FOR UPDATE`, and database errors are classified by SQLSTATE
//! and constraint name into typed [`StoreError`]s.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod errors;

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nutype::nutype;
use ordercore::{
    Age, Catalog, FirstName, IdempotencyKey, InventoryRecords, LastName, NewOrderHeader,
    NewOrderLine, NewProduct, NewUser, Operation, Order, OrderAggregates, OrderId, OrderLine,
    OrderStore, PasswordDigest, Price, Product, ProductDescription, ProductId, ProductStock,
    ProductTag, Quantity, StockLevel, StoreError, Timestamp, UnitOfWork, User, UserDirectory,
    UserId,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{query, Pool, Postgres, Row, Transaction};
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::errors::{map_sqlx_error, Violation};

/// Failures setting up the store, as opposed to failures of store operations.
#[derive(Debug, Error)]
pub enum PostgresStoreError {
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    #[error("failed to apply postgres migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),

    #[error("postgres did not answer a ping")]
    PingFailed(#[source] sqlx::Error),
}

/// Maximum number of database connections in the pool.
///
/// Must be at least 1, enforced by using `NonZeroU32` as the underlying type.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Configuration for the [`PostgresOrderStore`] connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
    /// Longest a statement may wait for a row lock before failing with
    /// `StoreError::LockContention` (default: 5 seconds). `None` waits forever.
    pub lock_timeout: Option<Duration>,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
            lock_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Order store backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresOrderStore {
    pool: Pool<Postgres>,
    lock_timeout: Option<Duration>,
}

impl PostgresOrderStore {
    /// Create a new store with default configuration.
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Create a new store with custom configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresStoreError> {
        let connection_string = connection_string.into();
        let max_connections: std::num::NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresStoreError::ConnectionFailed)?;
        info!(
            max_connections = max_connections.get(),
            "[postgres.connected] connection pool ready"
        );
        Ok(Self {
            pool,
            lock_timeout: config.lock_timeout,
        })
    }

    /// Create a store from an existing connection pool.
    ///
    /// Use this when you need full control over pool configuration or want to
    /// share a pool across multiple components.
    pub const fn from_pool(pool: Pool<Postgres>, lock_timeout: Option<Duration>) -> Self {
        Self { pool, lock_timeout }
    }

    /// Check that the database answers.
    pub async fn ping(&self) -> Result<(), PostgresStoreError> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(PostgresStoreError::PingFailed)
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), PostgresStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresStoreError::MigrationFailed)
    }

    /// Open a transaction with this store's lock timeout applied to it.
    async fn begin_transaction(
        &self,
        operation: Operation,
    ) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction, |_| None))?;

        if let Some(lock_timeout) = self.lock_timeout {
            query("SELECT set_config('lock_timeout', $1, true)")
                .bind(format!("{}ms", lock_timeout.as_millis()))
                .execute(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, operation, |_| None))?;
        }
        Ok(tx)
    }
}

/// One database transaction. Dropping it without commit rolls it back.
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PostgresUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresUnitOfWork").finish_non_exhaustive()
    }
}

/// Log and report a row whose stored values no longer satisfy the domain types.
fn corrupt_row(operation: Operation, column: &str) -> StoreError {
    error!(
        operation = %operation,
        column,
        "[postgres.corrupt_row] stored value violates domain constraints"
    );
    StoreError::StoreFailure { operation }
}

fn column<'r, T>(row: &'r PgRow, name: &str, operation: Operation) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|error| map_sqlx_error(error, operation, |_| None))
}

impl InventoryRecords for PostgresUnitOfWork {
    #[instrument(name = "postgres.lock_and_read_product", skip(self))]
    async fn lock_and_read_product(
        &mut self,
        product_id: ProductId,
    ) -> Result<ProductStock, StoreError> {
        const OP: Operation = Operation::LockProduct;

        let row = query("SELECT quantity, price FROM products WHERE id = $1 FOR UPDATE")
            .bind(product_id.into_inner())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|error| map_sqlx_error(error, OP, |_| None))?
            .ok_or(StoreError::ProductNotFound(product_id))?;

        let available = StockLevel::try_new(column::<i32>(&row, "quantity", OP)?)
            .map_err(|_| corrupt_row(OP, "quantity"))?;
        let price = Price::try_new(column::<Decimal>(&row, "price", OP)?)
            .map_err(|_| corrupt_row(OP, "price"))?;

        Ok(ProductStock {
            product_id,
            available,
            price,
        })
    }

    #[instrument(name = "postgres.decrement_quantity", skip(self))]
    async fn decrement_quantity(
        &mut self,
        product_id: ProductId,
        amount: Quantity,
    ) -> Result<StockLevel, StoreError> {
        const OP: Operation = Operation::DecrementQuantity;

        let row = query("UPDATE products SET quantity = quantity - $2 WHERE id = $1 RETURNING quantity")
            .bind(product_id.into_inner())
            .bind(amount.into_inner())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|error| {
                map_sqlx_error(error, OP, |violation| match violation {
                    Violation::Check("products_quantity_check") => Some(StoreError::StockUnderflow {
                        product_id,
                        requested: amount,
                    }),
                    _ => None,
                })
            })?
            .ok_or(StoreError::ProductNotFound(product_id))?;

        StockLevel::try_new(column::<i32>(&row, "quantity", OP)?)
            .map_err(|_| corrupt_row(OP, "quantity"))
    }
}

impl OrderAggregates for PostgresUnitOfWork {
    #[instrument(name = "postgres.insert_order_header", skip(self, header), fields(buyer = %header.buyer))]
    async fn insert_order_header(&mut self, header: NewOrderHeader) -> Result<OrderId, StoreError> {
        const OP: Operation = Operation::InsertOrderHeader;
        let NewOrderHeader {
            buyer,
            created_at,
            total_price,
            idempotency_key,
        } = header;

        let row = query(
            "INSERT INTO orders (user_id, created_at, total_price, idempotency_key)
             VALUES ($1, $2, $3, $4)
             RETURNING id",
        )
        .bind(buyer.into_inner())
        .bind(created_at.into_datetime())
        .bind(total_price.into_inner())
        .bind(idempotency_key.as_ref().map(|key| key.as_ref().to_string()))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|error| {
            map_sqlx_error(error, OP, |violation| match violation {
                Violation::ForeignKey("orders_user_id_fkey") => {
                    Some(StoreError::BuyerNotFound(buyer))
                }
                Violation::Unique("orders_idempotency_key_key") => idempotency_key
                    .clone()
                    .map(StoreError::DuplicateIdempotencyKey),
                _ => None,
            })
        })?;

        OrderId::try_new(column::<i64>(&row, "id", OP)?).map_err(|_| corrupt_row(OP, "id"))
    }

    #[instrument(
        name = "postgres.insert_order_line",
        skip(self, line),
        fields(order = %line.order_id, product = %line.product_id)
    )]
    async fn insert_order_line(&mut self, line: NewOrderLine) -> Result<(), StoreError> {
        const OP: Operation = Operation::InsertOrderLine;
        let NewOrderLine {
            order_id,
            product_id,
            position,
            quantity,
            unit_price,
        } = line;
        let position = i32::try_from(position).map_err(|_| corrupt_row(OP, "position"))?;

        query(
            "INSERT INTO order_lines (order_id, product_id, position, quantity, unit_price)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(order_id.into_inner())
        .bind(product_id.into_inner())
        .bind(position)
        .bind(quantity.into_inner())
        .bind(unit_price.into_inner())
        .execute(&mut *self.tx)
        .await
        .map_err(|error| {
            map_sqlx_error(error, OP, |violation| match violation {
                Violation::Unique("order_lines_pkey") => Some(StoreError::DuplicateLine {
                    order_id,
                    product_id,
                }),
                Violation::ForeignKey("order_lines_order_id_fkey") => {
                    Some(StoreError::OrderNotFound(order_id))
                }
                Violation::ForeignKey("order_lines_product_id_fkey") => {
                    Some(StoreError::ProductNotFound(product_id))
                }
                _ => None,
            })
        })?;
        Ok(())
    }

    #[instrument(name = "postgres.update_order_total", skip(self))]
    async fn update_order_total(&mut self, order_id: OrderId, total: Price) -> Result<(), StoreError> {
        let result = query("UPDATE orders SET total_price = $2 WHERE id = $1")
            .bind(order_id.into_inner())
            .bind(total.into_inner())
            .execute(&mut *self.tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::UpdateOrderTotal, |_| None))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::OrderNotFound(order_id));
        }
        Ok(())
    }
}

impl UnitOfWork for PostgresUnitOfWork {
    #[instrument(name = "postgres.commit", skip(self))]
    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction, |_| None))
    }

    #[instrument(name = "postgres.rollback", skip(self))]
    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::RollbackTransaction, |_| None))
    }
}

impl OrderStore for PostgresOrderStore {
    type UnitOfWork = PostgresUnitOfWork;

    #[instrument(name = "postgres.begin", skip(self))]
    async fn begin(&self) -> Result<Self::UnitOfWork, StoreError> {
        let tx = self.begin_transaction(Operation::BeginTransaction).await?;
        Ok(PostgresUnitOfWork { tx })
    }

    #[instrument(name = "postgres.find_order", skip(self))]
    async fn find_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        const OP: Operation = Operation::ReadOrder;

        let Some(header) = query(
            "SELECT user_id, created_at, total_price, idempotency_key FROM orders WHERE id = $1",
        )
        .bind(order_id.into_inner())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, OP, |_| None))?
        else {
            return Ok(None);
        };

        let line_rows = query(
            "SELECT product_id, quantity, unit_price FROM order_lines
             WHERE order_id = $1 ORDER BY position ASC",
        )
        .bind(order_id.into_inner())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, OP, |_| None))?;

        let mut lines = Vec::with_capacity(line_rows.len());
        for row in &line_rows {
            lines.push(OrderLine {
                product_id: ProductId::try_new(column::<i64>(row, "product_id", OP)?)
                    .map_err(|_| corrupt_row(OP, "product_id"))?,
                quantity: Quantity::try_new(column::<i32>(row, "quantity", OP)?)
                    .map_err(|_| corrupt_row(OP, "quantity"))?,
                unit_price: Price::try_new(column::<Decimal>(row, "unit_price", OP)?)
                    .map_err(|_| corrupt_row(OP, "unit_price"))?,
            });
        }

        let idempotency_key = column::<Option<String>>(&header, "idempotency_key", OP)?
            .map(IdempotencyKey::try_new)
            .transpose()
            .map_err(|_| corrupt_row(OP, "idempotency_key"))?;

        Ok(Some(Order {
            id: order_id,
            buyer: UserId::try_new(column::<i64>(&header, "user_id", OP)?)
                .map_err(|_| corrupt_row(OP, "user_id"))?,
            created_at: Timestamp::new(column::<DateTime<Utc>>(&header, "created_at", OP)?),
            total_price: Price::try_new(column::<Decimal>(&header, "total_price", OP)?)
                .map_err(|_| corrupt_row(OP, "total_price"))?,
            idempotency_key,
            lines,
        }))
    }

    #[instrument(name = "postgres.find_order_by_idempotency_key", skip(self))]
    async fn find_order_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<OrderId>, StoreError> {
        const OP: Operation = Operation::ReadOrder;

        let row = query("SELECT id FROM orders WHERE idempotency_key = $1")
            .bind(key.as_ref())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, OP, |_| None))?;

        row.map(|row| {
            OrderId::try_new(column::<i64>(&row, "id", OP)?).map_err(|_| corrupt_row(OP, "id"))
        })
        .transpose()
    }
}

impl Catalog for PostgresOrderStore {
    #[instrument(name = "postgres.create_product", skip(self, product))]
    async fn create_product(&self, product: NewProduct) -> Result<ProductId, StoreError> {
        const OP: Operation = Operation::WriteProduct;
        let tags: Vec<String> = product
            .tags
            .iter()
            .map(|tag| tag.as_ref().to_string())
            .collect();

        let row = query(
            "INSERT INTO products (description, tags, quantity, price)
             VALUES ($1, $2, $3, $4)
             RETURNING id",
        )
        .bind(product.description.as_ref())
        .bind(tags)
        .bind(product.quantity.into_inner())
        .bind(product.price.into_inner())
        .fetch_one(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, OP, |_| None))?;

        ProductId::try_new(column::<i64>(&row, "id", OP)?).map_err(|_| corrupt_row(OP, "id"))
    }

    #[instrument(name = "postgres.find_product", skip(self))]
    async fn find_product(&self, product_id: ProductId) -> Result<Option<Product>, StoreError> {
        const OP: Operation = Operation::ReadProduct;

        let Some(row) =
            query("SELECT description, tags, quantity, price FROM products WHERE id = $1")
                .bind(product_id.into_inner())
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, OP, |_| None))?
        else {
            return Ok(None);
        };

        let tags = column::<Vec<String>>(&row, "tags", OP)?
            .into_iter()
            .map(ProductTag::try_new)
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(|_| corrupt_row(OP, "tags"))?;

        Ok(Some(Product {
            id: product_id,
            description: ProductDescription::try_new(column::<String>(&row, "description", OP)?)
                .map_err(|_| corrupt_row(OP, "description"))?,
            tags,
            quantity: StockLevel::try_new(column::<i32>(&row, "quantity", OP)?)
                .map_err(|_| corrupt_row(OP, "quantity"))?,
            price: Price::try_new(column::<Decimal>(&row, "price", OP)?)
                .map_err(|_| corrupt_row(OP, "price"))?,
        }))
    }

    #[instrument(name = "postgres.set_product_quantity", skip(self))]
    async fn set_product_quantity(
        &self,
        product_id: ProductId,
        quantity: StockLevel,
    ) -> Result<(), StoreError> {
        const OP: Operation = Operation::WriteProduct;
        let mut tx = self.begin_transaction(OP).await?;

        let locked = query("SELECT id FROM products WHERE id = $1 FOR UPDATE")
            .bind(product_id.into_inner())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, OP, |_| None))?;
        if locked.is_none() {
            return Err(StoreError::ProductNotFound(product_id));
        }

        query("UPDATE products SET quantity = $2 WHERE id = $1")
            .bind(product_id.into_inner())
            .bind(quantity.into_inner())
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, OP, |_| None))?;

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction, |_| None))
    }
}

impl UserDirectory for PostgresOrderStore {
    #[instrument(name = "postgres.create_user", skip(self, user))]
    async fn create_user(&self, user: NewUser) -> Result<UserId, StoreError> {
        const OP: Operation = Operation::WriteUser;
        let digest = PasswordDigest::compute(&user.password);
        let age: i16 = user.age.into_inner();

        let row = query(
            "INSERT INTO users (first_name, last_name, age, is_married, password)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
        )
        .bind(user.first_name.as_ref())
        .bind(user.last_name.as_ref())
        .bind(age)
        .bind(user.is_married)
        .bind(digest.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            map_sqlx_error(error, OP, |violation| match violation {
                Violation::Unique("users_full_name_key") => Some(StoreError::DuplicateUser {
                    first_name: user.first_name.as_ref().to_string(),
                    last_name: user.last_name.as_ref().to_string(),
                }),
                _ => None,
            })
        })?;

        UserId::try_new(column::<i64>(&row, "id", OP)?).map_err(|_| corrupt_row(OP, "id"))
    }

    #[instrument(name = "postgres.find_user", skip(self))]
    async fn find_user(&self, user_id: UserId) -> Result<Option<User>, StoreError> {
        const OP: Operation = Operation::ReadUser;

        let Some(row) =
            query("SELECT first_name, last_name, age, is_married FROM users WHERE id = $1")
                .bind(user_id.into_inner())
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, OP, |_| None))?
        else {
            return Ok(None);
        };

        Ok(Some(User {
            id: user_id,
            first_name: FirstName::try_new(column::<String>(&row, "first_name", OP)?)
                .map_err(|_| corrupt_row(OP, "first_name"))?,
            last_name: LastName::try_new(column::<String>(&row, "last_name", OP)?)
                .map_err(|_| corrupt_row(OP, "last_name"))?,
            age: Age::try_new(column::<i16>(&row, "age", OP)?)
                .map_err(|_| corrupt_row(OP, "age"))?,
            is_married: column::<bool>(&row, "is_married", OP)?,
        }))
    }
}
