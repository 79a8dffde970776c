//! In-memory adapter for the `OrderCore` order placement library
//!
//! Every product row carries its own async mutex, which plays the part of a
//! database row lock: a unit of work holds the guard until it commits or is
//! dropped. Writes made inside a unit of work are staged and applied in one
//! step at commit, so dropping an uncommitted unit of work is a rollback.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ordercore::{
    Catalog, IdempotencyKey, InventoryRecords, NewOrderHeader, NewOrderLine, NewProduct,
    NewUser, Operation, Order, OrderAggregates, OrderId, OrderLine, OrderStore, Price,
    Product, ProductId, ProductStock, Quantity, StockLevel, StoreError, UnitOfWork, User,
    UserDirectory, UserId,
};
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// A product row: the committed values plus the lock that guards changes to them.
struct ProductSlot {
    row_lock: Arc<Mutex<()>>,
    row: RwLock<Product>,
}

#[derive(Default)]
struct Tables {
    products: RwLock<HashMap<ProductId, Arc<ProductSlot>>>,
    users: RwLock<HashMap<UserId, User>>,
    orders: RwLock<BTreeMap<OrderId, Order>>,
    order_keys: RwLock<HashMap<IdempotencyKey, OrderId>>,
    product_seq: AtomicI64,
    user_seq: AtomicI64,
    order_seq: AtomicI64,
}

impl Tables {
    fn slot(&self, product_id: ProductId) -> Option<Arc<ProductSlot>> {
        self.products.read().get(&product_id).cloned()
    }
}

/// Draw the next positive id from `seq` and wrap it.
fn next_id<T, E>(
    seq: &AtomicI64,
    wrap: impl FnOnce(i64) -> Result<T, E>,
    operation: Operation,
) -> Result<T, StoreError> {
    let raw = seq.fetch_add(1, Ordering::Relaxed) + 1;
    wrap(raw).map_err(|_| StoreError::StoreFailure { operation })
}

/// Thread-safe in-memory order store for tests and local runs.
///
/// Clones share the same tables.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    tables: Arc<Tables>,
    lock_timeout: Option<Duration>,
}

impl InMemoryOrderStore {
    /// Create a new empty store whose row locks wait indefinitely.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound row lock waits. A wait that runs out fails with
    /// `StoreError::LockContention`.
    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = Some(lock_timeout);
        self
    }

    /// Number of committed orders.
    pub fn order_count(&self) -> usize {
        self.tables.orders.read().len()
    }

    async fn acquire(
        &self,
        slot: &ProductSlot,
        product_id: ProductId,
        operation: Operation,
    ) -> Result<OwnedMutexGuard<()>, StoreError> {
        acquire_row_lock(slot, product_id, self.lock_timeout, operation).await
    }
}

async fn acquire_row_lock(
    slot: &ProductSlot,
    product_id: ProductId,
    lock_timeout: Option<Duration>,
    operation: Operation,
) -> Result<OwnedMutexGuard<()>, StoreError> {
    let lock = Arc::clone(&slot.row_lock);
    match lock_timeout {
        None => Ok(lock.lock_owned().await),
        Some(limit) => tokio::time::timeout(limit, lock.lock_owned())
            .await
            .map_err(|_| {
                warn!(
                    product = %product_id,
                    operation = %operation,
                    "[memory.lock_timeout] row lock wait exceeded limit"
                );
                StoreError::LockContention { operation }
            }),
    }
}

impl std::fmt::Debug for InMemoryOrderStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOrderStore")
            .field("products", &self.tables.products.read().len())
            .field("orders", &self.tables.orders.read().len())
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

struct LockedRow {
    slot: Arc<ProductSlot>,
    _guard: OwnedMutexGuard<()>,
    /// Stock as this unit of work sees it, including its own decrements.
    quantity: StockLevel,
    price: Price,
}

struct PendingOrder {
    header: NewOrderHeader,
    lines: Vec<NewOrderLine>,
}

/// A unit of work against [`InMemoryOrderStore`].
///
/// Holds the row locks it has taken until it is committed or dropped.
pub struct InMemoryUnitOfWork {
    tables: Arc<Tables>,
    lock_timeout: Option<Duration>,
    locked: HashMap<ProductId, LockedRow>,
    pending: BTreeMap<OrderId, PendingOrder>,
}

impl InMemoryUnitOfWork {
    fn pending_order(&mut self, order_id: OrderId) -> Result<&mut PendingOrder, StoreError> {
        self.pending
            .get_mut(&order_id)
            .ok_or(StoreError::OrderNotFound(order_id))
    }
}

impl InventoryRecords for InMemoryUnitOfWork {
    async fn lock_and_read_product(
        &mut self,
        product_id: ProductId,
    ) -> Result<ProductStock, StoreError> {
        if let Some(row) = self.locked.get(&product_id) {
            return Ok(ProductStock {
                product_id,
                available: row.quantity,
                price: row.price,
            });
        }

        let slot = self
            .tables
            .slot(product_id)
            .ok_or(StoreError::ProductNotFound(product_id))?;
        let guard =
            acquire_row_lock(&slot, product_id, self.lock_timeout, Operation::LockProduct).await?;
        let (quantity, price) = {
            let row = slot.row.read();
            (row.quantity, row.price)
        };
        debug!(
            product = %product_id,
            available = %quantity,
            "[memory.lock_product] row lock acquired"
        );

        let _ = self.locked.insert(
            product_id,
            LockedRow {
                slot,
                _guard: guard,
                quantity,
                price,
            },
        );
        Ok(ProductStock {
            product_id,
            available: quantity,
            price,
        })
    }

    async fn decrement_quantity(
        &mut self,
        product_id: ProductId,
        amount: Quantity,
    ) -> Result<StockLevel, StoreError> {
        if !self.locked.contains_key(&product_id) {
            let _ = self.lock_and_read_product(product_id).await?;
        }
        let row = self
            .locked
            .get_mut(&product_id)
            .ok_or(StoreError::ProductNotFound(product_id))?;
        let remaining = row
            .quantity
            .checked_sub(amount)
            .ok_or(StoreError::StockUnderflow {
                product_id,
                requested: amount,
            })?;
        row.quantity = remaining;
        Ok(remaining)
    }
}

impl OrderAggregates for InMemoryUnitOfWork {
    async fn insert_order_header(&mut self, header: NewOrderHeader) -> Result<OrderId, StoreError> {
        if !self.tables.users.read().contains_key(&header.buyer) {
            return Err(StoreError::BuyerNotFound(header.buyer));
        }
        if let Some(key) = &header.idempotency_key {
            let taken_here = self
                .pending
                .values()
                .any(|order| order.header.idempotency_key.as_ref() == Some(key));
            if taken_here || self.tables.order_keys.read().contains_key(key) {
                return Err(StoreError::DuplicateIdempotencyKey(key.clone()));
            }
        }

        let order_id = next_id(
            &self.tables.order_seq,
            OrderId::try_new,
            Operation::InsertOrderHeader,
        )?;
        let _ = self.pending.insert(
            order_id,
            PendingOrder {
                header,
                lines: Vec::new(),
            },
        );
        Ok(order_id)
    }

    async fn insert_order_line(&mut self, line: NewOrderLine) -> Result<(), StoreError> {
        if self.tables.slot(line.product_id).is_none() {
            return Err(StoreError::ProductNotFound(line.product_id));
        }
        let order = self.pending_order(line.order_id)?;
        if order
            .lines
            .iter()
            .any(|existing| existing.product_id == line.product_id)
        {
            return Err(StoreError::DuplicateLine {
                order_id: line.order_id,
                product_id: line.product_id,
            });
        }
        order.lines.push(line);
        Ok(())
    }

    async fn update_order_total(&mut self, order_id: OrderId, total: Price) -> Result<(), StoreError> {
        self.pending_order(order_id)?.header.total_price = total;
        Ok(())
    }
}

impl UnitOfWork for InMemoryUnitOfWork {
    async fn commit(self) -> Result<(), StoreError> {
        let Self {
            tables,
            locked,
            pending,
            ..
        } = self;

        // Both order tables stay write-locked until every write is applied.
        let mut orders = tables.orders.write();
        let mut order_keys = tables.order_keys.write();

        for order in pending.values() {
            if let Some(key) = &order.header.idempotency_key {
                if order_keys.contains_key(key) {
                    return Err(StoreError::DuplicateIdempotencyKey(key.clone()));
                }
            }
        }

        for row in locked.values() {
            row.slot.row.write().quantity = row.quantity;
        }

        for (order_id, PendingOrder { header, mut lines }) in pending {
            lines.sort_by_key(|line| line.position);
            if let Some(key) = &header.idempotency_key {
                let _ = order_keys.insert(key.clone(), order_id);
            }
            let _ = orders.insert(
                order_id,
                Order {
                    id: order_id,
                    buyer: header.buyer,
                    created_at: header.created_at,
                    total_price: header.total_price,
                    idempotency_key: header.idempotency_key,
                    lines: lines.into_iter().map(OrderLine::from).collect(),
                },
            );
        }
        drop(order_keys);
        drop(orders);

        // Row locks are released only after the writes are visible.
        drop(locked);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        debug!(
            locked = self.locked.len(),
            "[memory.rollback] discarding staged writes"
        );
        Ok(())
    }
}

impl OrderStore for InMemoryOrderStore {
    type UnitOfWork = InMemoryUnitOfWork;

    async fn begin(&self) -> Result<Self::UnitOfWork, StoreError> {
        Ok(InMemoryUnitOfWork {
            tables: Arc::clone(&self.tables),
            lock_timeout: self.lock_timeout,
            locked: HashMap::new(),
            pending: BTreeMap::new(),
        })
    }

    async fn find_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.tables.orders.read().get(&order_id).cloned())
    }

    async fn find_order_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<OrderId>, StoreError> {
        Ok(self.tables.order_keys.read().get(key).copied())
    }
}

impl Catalog for InMemoryOrderStore {
    async fn create_product(&self, product: NewProduct) -> Result<ProductId, StoreError> {
        let product_id = next_id(
            &self.tables.product_seq,
            ProductId::try_new,
            Operation::WriteProduct,
        )?;
        let slot = ProductSlot {
            row_lock: Arc::new(Mutex::new(())),
            row: RwLock::new(Product::from_new(product_id, product)),
        };
        let _ = self
            .tables
            .products
            .write()
            .insert(product_id, Arc::new(slot));
        Ok(product_id)
    }

    async fn find_product(&self, product_id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self
            .tables
            .slot(product_id)
            .map(|slot| slot.row.read().clone()))
    }

    async fn set_product_quantity(
        &self,
        product_id: ProductId,
        quantity: StockLevel,
    ) -> Result<(), StoreError> {
        let slot = self
            .tables
            .slot(product_id)
            .ok_or(StoreError::ProductNotFound(product_id))?;
        let _guard = self
            .acquire(&slot, product_id, Operation::WriteProduct)
            .await?;
        slot.row.write().quantity = quantity;
        Ok(())
    }
}

impl UserDirectory for InMemoryOrderStore {
    async fn create_user(&self, user: NewUser) -> Result<UserId, StoreError> {
        let mut users = self.tables.users.write();
        let name_taken = users
            .values()
            .any(|stored| stored.first_name == user.first_name && stored.last_name == user.last_name);
        if name_taken {
            return Err(StoreError::DuplicateUser {
                first_name: user.first_name.into_inner(),
                last_name: user.last_name.into_inner(),
            });
        }

        let user_id = next_id(&self.tables.user_seq, UserId::try_new, Operation::WriteUser)?;
        match users.entry(user_id) {
            Entry::Occupied(_) => Err(StoreError::StoreFailure {
                operation: Operation::WriteUser,
            }),
            Entry::Vacant(entry) => {
                let _ = entry.insert(User {
                    id: user_id,
                    first_name: user.first_name,
                    last_name: user.last_name,
                    age: user.age,
                    is_married: user.is_married,
                });
                Ok(user_id)
            }
        }
    }

    async fn find_user(&self, user_id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self
            .tables
            .users
            .read()
            .get(&user_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordercore::{Age, FirstName, LastName, Password, ProductDescription, Timestamp};
    use rust_decimal_macros::dec;
    use std::collections::BTreeSet;

    fn new_product(quantity: i32) -> NewProduct {
        NewProduct {
            description: ProductDescription::try_new("widget").expect("valid description"),
            tags: BTreeSet::new(),
            quantity: StockLevel::try_new(quantity).expect("valid stock"),
            price: Price::try_new(dec!(10.00)).expect("valid price"),
        }
    }

    fn new_user(first: &str, last: &str) -> NewUser {
        NewUser {
            first_name: FirstName::try_new(first).expect("valid first name"),
            last_name: LastName::try_new(last).expect("valid last name"),
            age: Age::try_new(30).expect("valid age"),
            is_married: false,
            password: Password::try_new("s3cret-pass".to_string()).expect("valid password"),
        }
    }

    fn quantity(units: i32) -> Quantity {
        Quantity::try_new(units).expect("valid quantity")
    }

    #[tokio::test]
    async fn dropped_unit_of_work_leaves_stock_untouched() {
        // Given: a product with 5 units
        let store = InMemoryOrderStore::new();
        let product = store
            .create_product(new_product(5))
            .await
            .expect("product should be created");

        // When: a unit of work decrements it and is dropped without commit
        {
            let mut unit = store.begin().await.expect("unit of work should open");
            let remaining = unit
                .decrement_quantity(product, quantity(3))
                .await
                .expect("decrement should succeed");
            assert_eq!(remaining.into_inner(), 2);
        }

        // Then: the committed stock is unchanged
        let stored = store
            .find_product(product)
            .await
            .expect("read should succeed")
            .expect("product should exist");
        assert_eq!(stored.quantity.into_inner(), 5);
    }

    #[tokio::test]
    async fn committed_decrement_is_visible() {
        let store = InMemoryOrderStore::new();
        let product = store
            .create_product(new_product(5))
            .await
            .expect("product should be created");

        let mut unit = store.begin().await.expect("unit of work should open");
        let _ = unit
            .decrement_quantity(product, quantity(2))
            .await
            .expect("decrement should succeed");
        unit.commit().await.expect("commit should succeed");

        let stored = store
            .find_product(product)
            .await
            .expect("read should succeed")
            .expect("product should exist");
        assert_eq!(stored.quantity.into_inner(), 3);
    }

    #[tokio::test]
    async fn decrement_below_zero_is_refused() {
        let store = InMemoryOrderStore::new();
        let product = store
            .create_product(new_product(1))
            .await
            .expect("product should be created");

        let mut unit = store.begin().await.expect("unit of work should open");
        let result = unit.decrement_quantity(product, quantity(2)).await;

        assert_eq!(
            result,
            Err(StoreError::StockUnderflow {
                product_id: product,
                requested: quantity(2)
            })
        );
    }

    #[tokio::test]
    async fn relocking_a_held_row_sees_own_decrements() {
        let store = InMemoryOrderStore::new();
        let product = store
            .create_product(new_product(5))
            .await
            .expect("product should be created");

        let mut unit = store.begin().await.expect("unit of work should open");
        let _ = unit
            .decrement_quantity(product, quantity(4))
            .await
            .expect("decrement should succeed");
        let stock = unit
            .lock_and_read_product(product)
            .await
            .expect("relock should not block");

        assert_eq!(stock.available.into_inner(), 1);
    }

    #[tokio::test]
    async fn held_row_lock_times_out_second_unit_of_work() {
        // Given: a store with a short lock timeout and one unit of work holding product 1
        let store = InMemoryOrderStore::new().with_lock_timeout(Duration::from_millis(20));
        let product = store
            .create_product(new_product(5))
            .await
            .expect("product should be created");
        let mut holder = store.begin().await.expect("unit of work should open");
        let _ = holder
            .lock_and_read_product(product)
            .await
            .expect("first lock should succeed");

        // When: a second unit of work asks for the same row
        let mut waiter = store.begin().await.expect("unit of work should open");
        let result = waiter.lock_and_read_product(product).await;

        // Then: it gives up with lock contention
        assert_eq!(
            result,
            Err(StoreError::LockContention {
                operation: Operation::LockProduct
            })
        );
    }

    #[tokio::test]
    async fn missing_buyer_is_reported() {
        let store = InMemoryOrderStore::new();
        let buyer = UserId::try_new(42).expect("valid id");

        let mut unit = store.begin().await.expect("unit of work should open");
        let result = unit
            .insert_order_header(NewOrderHeader {
                buyer,
                created_at: Timestamp::now(),
                total_price: Price::zero(),
                idempotency_key: None,
            })
            .await;

        assert_eq!(result, Err(StoreError::BuyerNotFound(buyer)));
    }

    #[tokio::test]
    async fn duplicate_line_is_reported() {
        let store = InMemoryOrderStore::new();
        let buyer = store
            .create_user(new_user("Ada", "Lovelace"))
            .await
            .expect("user should be created");
        let product = store
            .create_product(new_product(5))
            .await
            .expect("product should be created");

        let mut unit = store.begin().await.expect("unit of work should open");
        let order_id = unit
            .insert_order_header(NewOrderHeader {
                buyer,
                created_at: Timestamp::now(),
                total_price: Price::zero(),
                idempotency_key: None,
            })
            .await
            .expect("header should be written");
        let line = NewOrderLine {
            order_id,
            product_id: product,
            position: 0,
            quantity: quantity(1),
            unit_price: Price::zero(),
        };
        unit.insert_order_line(line)
            .await
            .expect("first line should be written");

        let result = unit.insert_order_line(NewOrderLine { position: 1, ..line }).await;

        assert_eq!(
            result,
            Err(StoreError::DuplicateLine {
                order_id,
                product_id: product
            })
        );
    }

    #[tokio::test]
    async fn duplicate_user_names_are_rejected() {
        let store = InMemoryOrderStore::new();
        let _ = store
            .create_user(new_user("Ada", "Lovelace"))
            .await
            .expect("first user should be created");

        let result = store.create_user(new_user(" Ada ", "Lovelace")).await;

        assert_eq!(
            result,
            Err(StoreError::DuplicateUser {
                first_name: "Ada".to_string(),
                last_name: "Lovelace".to_string()
            })
        );
    }

    #[tokio::test]
    async fn restock_waits_for_row_lock() {
        // Given: a unit of work holding the product row
        let store = InMemoryOrderStore::new().with_lock_timeout(Duration::from_millis(20));
        let product = store
            .create_product(new_product(5))
            .await
            .expect("product should be created");
        let mut holder = store.begin().await.expect("unit of work should open");
        let _ = holder
            .lock_and_read_product(product)
            .await
            .expect("lock should succeed");

        // When: a restock is attempted while the lock is held
        let blocked = store
            .set_product_quantity(product, StockLevel::try_new(50).expect("valid stock"))
            .await;

        // Then: it times out, and succeeds once the holder is gone
        assert_eq!(
            blocked,
            Err(StoreError::LockContention {
                operation: Operation::WriteProduct
            })
        );
        drop(holder);
        store
            .set_product_quantity(product, StockLevel::try_new(50).expect("valid stock"))
            .await
            .expect("restock should succeed after release");
    }
}
