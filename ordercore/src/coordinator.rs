//! The order transaction coordinator.
//!
//! [`OrderCoordinator::create_order`] runs one order placement as a single
//! unit of work: write the header, then for every line lock the product row,
//! check stock, write the line and decrement stock, then settle the total and
//! commit. Any failure rolls the whole unit of work back, so a committed order
//! always has all of its lines and all of its decrements.

use std::time::Duration;

use tracing::{error, info, instrument, warn, Span};

use crate::config::{CoordinatorConfig, LockOrdering, TotalPolicy};
use crate::errors::{OrderError, Operation, ReferenceKind, StoreError};
use crate::model::{NewOrderHeader, NewOrderLine, Order};
use crate::request::{OrderRequest, RequestError, RequestedLine};
use crate::store::{InventoryRecords, OrderAggregates, OrderStore, UnitOfWork};
use crate::types::{IdempotencyKey, OrderId, Price, Timestamp};

/// Why a reservation stopped before commit.
enum Reservation {
    /// The order is rejected with this error.
    Rejected(OrderError),
    /// Another order already holds the idempotency key; replay it.
    KeyTaken(IdempotencyKey),
}

impl From<OrderError> for Reservation {
    fn from(error: OrderError) -> Self {
        Self::Rejected(error)
    }
}

/// Places and reads orders against an [`OrderStore`].
///
/// The coordinator holds no per-request state; share one instance behind an
/// `Arc` across request tasks.
#[derive(Debug, Clone)]
pub struct OrderCoordinator<S> {
    store: S,
    config: CoordinatorConfig,
}

impl<S> OrderCoordinator<S>
where
    S: OrderStore,
{
    /// Create a coordinator with the default configuration.
    pub fn new(store: S) -> Self {
        Self::with_config(store, CoordinatorConfig::default())
    }

    /// Create a coordinator with explicit settings.
    pub const fn with_config(store: S, config: CoordinatorConfig) -> Self {
        Self { store, config }
    }

    /// The backing store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Active settings.
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Place an order within the configured deadline.
    ///
    /// Returns the new order's id, or the id of the existing order when the
    /// request carries an idempotency key that was already used.
    ///
    /// # Errors
    ///
    /// * `OrderError::DuplicateLine` - a product appears on two lines
    /// * `OrderError::ReferenceNotFound` - the buyer or a product does not exist
    /// * `OrderError::InsufficientInventory` - a line asks for more than is on hand
    /// * `OrderError::TotalMismatch` - the declared total is wrong and totals are enforced
    /// * `OrderError::Timeout` - the deadline passed; nothing was written
    /// * `OrderError::PersistenceFailure` - the store failed; nothing was written
    pub async fn create_order(&self, request: OrderRequest) -> Result<OrderId, OrderError> {
        self.create_order_with_deadline(request, self.config.order_timeout.as_duration())
            .await
    }

    /// Place an order, giving up after `deadline`.
    ///
    /// On expiry the in-flight unit of work is dropped, which rolls it back
    /// and releases every row lock it held.
    #[instrument(
        name = "coordinator.create_order",
        skip(self, request),
        fields(
            buyer = %request.buyer(),
            lines = request.lines().len(),
            order = tracing::field::Empty
        )
    )]
    pub async fn create_order_with_deadline(
        &self,
        request: OrderRequest,
        deadline: Duration,
    ) -> Result<OrderId, OrderError> {
        if let Some(product) = request.first_duplicate_product() {
            warn!(
                buyer = %request.buyer(),
                product = %product,
                "[coordinator.duplicate_line] product requested on more than one line"
            );
            return Err(OrderError::DuplicateLine(product));
        }

        match tokio::time::timeout(deadline, self.place(&request)).await {
            Ok(Ok(order_id)) => {
                Span::current().record("order", order_id.into_inner());
                info!(
                    buyer = %request.buyer(),
                    order = %order_id,
                    "[coordinator.order_created] order placed"
                );
                Ok(order_id)
            }
            Ok(Err(error)) => Err(error),
            Err(_elapsed) => {
                error!(
                    buyer = %request.buyer(),
                    deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                    "[coordinator.timeout] order placement exceeded its deadline, rolled back"
                );
                Err(OrderError::Timeout(deadline))
            }
        }
    }

    /// Read a committed order.
    #[instrument(name = "coordinator.get_order", skip(self))]
    pub async fn get_order(&self, order_id: OrderId) -> Result<Order, OrderError> {
        match self.store.find_order(order_id).await {
            Ok(Some(order)) => Ok(order),
            Ok(None) => Err(OrderError::ReferenceNotFound {
                kind: ReferenceKind::Order,
                id: order_id.into_inner(),
            }),
            Err(store_error) => {
                error!(
                    order = %order_id,
                    error = %store_error,
                    "[coordinator.read_failed] could not read order"
                );
                Err(OrderError::from(store_error))
            }
        }
    }

    async fn place(&self, request: &OrderRequest) -> Result<OrderId, OrderError> {
        if let Some(key) = request.idempotency_key() {
            if let Some(existing) = self.lookup_key(key).await? {
                info!(
                    buyer = %request.buyer(),
                    order = %existing,
                    "[coordinator.idempotent_replay] returning existing order for idempotency key"
                );
                return Ok(existing);
            }
        }

        let mut unit = self.store.begin().await.map_err(|store_error| {
            error!(
                buyer = %request.buyer(),
                error = %store_error,
                "[coordinator.begin_failed] could not open unit of work"
            );
            OrderError::from(store_error)
        })?;

        match self.reserve(&mut unit, request).await {
            Ok(order_id) => match unit.commit().await {
                Ok(()) => Ok(order_id),
                Err(StoreError::DuplicateIdempotencyKey(key)) => self.replay_after_race(key).await,
                Err(store_error) => {
                    error!(
                        buyer = %request.buyer(),
                        order = %order_id,
                        error = %store_error,
                        "[coordinator.commit_failed] commit failed, order discarded"
                    );
                    Err(OrderError::from(store_error))
                }
            },
            Err(reservation) => {
                if let Err(rollback_error) = unit.rollback().await {
                    warn!(
                        buyer = %request.buyer(),
                        error = %rollback_error,
                        "[coordinator.rollback_failed] explicit rollback failed, store discards the unit of work"
                    );
                }
                match reservation {
                    Reservation::Rejected(order_error) => Err(order_error),
                    Reservation::KeyTaken(key) => self.replay_after_race(key).await,
                }
            }
        }
    }

    /// Every step between `begin` and `commit`.
    async fn reserve(
        &self,
        unit: &mut S::UnitOfWork,
        request: &OrderRequest,
    ) -> Result<OrderId, Reservation> {
        let buyer = request.buyer();
        let header = NewOrderHeader {
            buyer,
            created_at: Timestamp::now(),
            total_price: request.declared_total().unwrap_or_else(Price::zero),
            idempotency_key: request.idempotency_key().cloned(),
        };

        let order_id = match unit.insert_order_header(header).await {
            Ok(order_id) => order_id,
            Err(StoreError::DuplicateIdempotencyKey(key)) => {
                return Err(Reservation::KeyTaken(key));
            }
            Err(store_error) => {
                warn!(
                    buyer = %buyer,
                    error = %store_error,
                    "[coordinator.header_rejected] order header could not be written"
                );
                return Err(OrderError::from(store_error).into());
            }
        };

        let mut total = Price::zero();
        for (position, line) in lock_sequence(self.config.lock_ordering, request.lines()) {
            let line_total = Self::reserve_line(unit, order_id, position, line).await?;
            total = total
                .checked_add(line_total)
                .ok_or(OrderError::InvalidRequest(RequestError::TotalOverflow))?;
        }

        self.settle_total(unit, request, order_id, total).await?;

        info!(
            buyer = %buyer,
            order = %order_id,
            total = %total,
            "[coordinator.reserved] inventory reserved, committing"
        );
        Ok(order_id)
    }

    /// Lock, check, write and decrement one line. Returns the line total.
    async fn reserve_line(
        unit: &mut S::UnitOfWork,
        order_id: OrderId,
        position: usize,
        line: &RequestedLine,
    ) -> Result<Price, OrderError> {
        let RequestedLine {
            product_id,
            quantity,
        } = *line;

        let stock = unit
            .lock_and_read_product(product_id)
            .await
            .map_err(|store_error| {
                warn!(
                    order = %order_id,
                    product = %product_id,
                    error = %store_error,
                    "[coordinator.lock_failed] could not lock product"
                );
                match store_error {
                    StoreError::ProductNotFound(_) => OrderError::ReferenceNotFound {
                        kind: ReferenceKind::Product,
                        id: product_id.into_inner(),
                    },
                    other => OrderError::from(other),
                }
            })?;

        if !stock.available.covers(quantity) {
            warn!(
                order = %order_id,
                product = %product_id,
                available = %stock.available,
                requested = %quantity,
                "[coordinator.insufficient_inventory] not enough stock"
            );
            return Err(OrderError::InsufficientInventory {
                product_id,
                available: stock.available,
                requested: quantity,
            });
        }

        let line_total = stock
            .price
            .line_total(quantity)
            .ok_or(OrderError::InvalidRequest(RequestError::TotalOverflow))?;
        let position = u32::try_from(position).map_err(|_| {
            OrderError::InvalidRequest(RequestError::TooManyLines {
                count: position.saturating_add(1),
            })
        })?;

        unit.insert_order_line(NewOrderLine {
            order_id,
            product_id,
            position,
            quantity,
            unit_price: stock.price,
        })
        .await
        .map_err(|store_error| {
            warn!(
                order = %order_id,
                product = %product_id,
                error = %store_error,
                "[coordinator.line_rejected] order line could not be written"
            );
            match store_error {
                StoreError::ProductNotFound(_) => OrderError::ReferenceNotFound {
                    kind: ReferenceKind::Product,
                    id: product_id.into_inner(),
                },
                StoreError::DuplicateLine { .. } => OrderError::DuplicateLine(product_id),
                other => OrderError::from(other),
            }
        })?;

        unit.decrement_quantity(product_id, quantity)
            .await
            .map_err(|store_error| {
                error!(
                    order = %order_id,
                    product = %product_id,
                    error = %store_error,
                    "[coordinator.decrement_failed] stock decrement refused under lock"
                );
                match store_error {
                    StoreError::StockUnderflow { .. } => OrderError::InsufficientInventory {
                        product_id,
                        available: stock.available,
                        requested: quantity,
                    },
                    other => OrderError::from(other),
                }
            })?;

        Ok(line_total)
    }

    /// Compare the declared total with the computed one and store the result.
    async fn settle_total(
        &self,
        unit: &mut S::UnitOfWork,
        request: &OrderRequest,
        order_id: OrderId,
        computed: Price,
    ) -> Result<(), OrderError> {
        match request.declared_total() {
            Some(declared) if declared.same_amount(computed) => return Ok(()),
            Some(declared) => match self.config.total_policy {
                TotalPolicy::Enforce => {
                    warn!(
                        order = %order_id,
                        declared = %declared,
                        computed = %computed,
                        "[coordinator.total_mismatch] declared total rejected"
                    );
                    return Err(OrderError::TotalMismatch { declared, computed });
                }
                TotalPolicy::Recompute => {
                    warn!(
                        order = %order_id,
                        declared = %declared,
                        computed = %computed,
                        "[coordinator.total_recomputed] declared total replaced by computed total"
                    );
                }
            },
            None => {}
        }

        unit.update_order_total(order_id, computed)
            .await
            .map_err(|store_error| {
                error!(
                    order = %order_id,
                    error = %store_error,
                    "[coordinator.total_update_failed] could not store order total"
                );
                match store_error {
                    StoreError::OrderNotFound(_) => OrderError::PersistenceFailure {
                        operation: Operation::UpdateOrderTotal,
                    },
                    other => OrderError::from(other),
                }
            })
    }

    async fn lookup_key(&self, key: &IdempotencyKey) -> Result<Option<OrderId>, OrderError> {
        self.store
            .find_order_by_idempotency_key(key)
            .await
            .map_err(|store_error| {
                error!(
                    key = %key,
                    error = %store_error,
                    "[coordinator.key_lookup_failed] could not look up idempotency key"
                );
                OrderError::PersistenceFailure {
                    operation: Operation::ReadOrder,
                }
            })
    }

    /// A concurrent request committed the same key first; hand back its order.
    async fn replay_after_race(&self, key: IdempotencyKey) -> Result<OrderId, OrderError> {
        match self.lookup_key(&key).await? {
            Some(existing) => {
                info!(
                    key = %key,
                    order = %existing,
                    "[coordinator.idempotent_replay] concurrent request won the key, returning its order"
                );
                Ok(existing)
            }
            None => {
                error!(
                    key = %key,
                    "[coordinator.key_vanished] idempotency key conflicted but no order carries it"
                );
                Err(OrderError::PersistenceFailure {
                    operation: Operation::InsertOrderHeader,
                })
            }
        }
    }
}

/// Line indexes paired with lines, in the order their rows get locked.
fn lock_sequence(ordering: LockOrdering, lines: &[RequestedLine]) -> Vec<(usize, &RequestedLine)> {
    let mut sequence: Vec<_> = lines.iter().enumerate().collect();
    if ordering == LockOrdering::ProductId {
        sequence.sort_by_key(|(_, line)| line.product_id);
    }
    sequence
}
