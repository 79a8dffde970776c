//! Storage seams for order placement.
//!
//! An [`OrderStore`] hands out [`UnitOfWork`]s. A unit of work is one
//! transactional scope: the inventory and order writes made through it become
//! visible together on [`UnitOfWork::commit`], or not at all. Dropping a unit
//! of work without committing rolls it back.
//!
//! Row locks taken by [`InventoryRecords::lock_and_read_product`] are held
//! until the unit of work ends. Two units of work that touch disjoint products
//! never wait on each other.

use std::future::Future;

use crate::errors::StoreError;
use crate::model::{
    NewOrderHeader, NewOrderLine, NewProduct, NewUser, Order, Product, ProductStock, User,
};
use crate::types::{IdempotencyKey, OrderId, Price, ProductId, Quantity, StockLevel, UserId};

/// Inventory operations scoped to a unit of work.
pub trait InventoryRecords {
    /// Take the exclusive row lock on `product_id` and read its stock and price.
    ///
    /// Blocks while another unit of work holds the lock. Calling it again for a
    /// product this unit of work already holds returns the current (possibly
    /// already decremented) values without blocking.
    ///
    /// # Errors
    ///
    /// * `StoreError::ProductNotFound` - no such product
    /// * `StoreError::LockContention` - the lock wait exceeded the store's limit
    fn lock_and_read_product(
        &mut self,
        product_id: ProductId,
    ) -> impl Future<Output = Result<ProductStock, StoreError>> + Send;

    /// Reduce the stock of a locked product and return what is left.
    ///
    /// Refuses with `StoreError::StockUnderflow` instead of going negative.
    fn decrement_quantity(
        &mut self,
        product_id: ProductId,
        amount: Quantity,
    ) -> impl Future<Output = Result<StockLevel, StoreError>> + Send;
}

/// Order aggregate writes scoped to a unit of work.
pub trait OrderAggregates {
    /// Write the order header and return the identifier assigned to it.
    ///
    /// # Errors
    ///
    /// * `StoreError::BuyerNotFound` - the buyer does not exist
    /// * `StoreError::DuplicateIdempotencyKey` - another order already carries the key
    fn insert_order_header(
        &mut self,
        header: NewOrderHeader,
    ) -> impl Future<Output = Result<OrderId, StoreError>> + Send;

    /// Write one order line.
    ///
    /// # Errors
    ///
    /// * `StoreError::DuplicateLine` - the order already has a line for the product
    /// * `StoreError::OrderNotFound` / `StoreError::ProductNotFound` - dangling reference
    fn insert_order_line(
        &mut self,
        line: NewOrderLine,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Replace the stored total of an order written by this unit of work.
    fn update_order_total(
        &mut self,
        order_id: OrderId,
        total: Price,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// One transactional scope over inventory and orders.
pub trait UnitOfWork: InventoryRecords + OrderAggregates + Send {
    /// Make every write of this unit of work visible atomically and release its locks.
    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Discard every write of this unit of work and release its locks.
    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Entry point of a storage backend for orders.
pub trait OrderStore: Send + Sync {
    /// Unit of work type produced by [`OrderStore::begin`].
    type UnitOfWork: UnitOfWork;

    /// Open a new unit of work.
    fn begin(&self) -> impl Future<Output = Result<Self::UnitOfWork, StoreError>> + Send;

    /// Read a committed order with its lines in request order.
    fn find_order(
        &self,
        order_id: OrderId,
    ) -> impl Future<Output = Result<Option<Order>, StoreError>> + Send;

    /// Look up the committed order carrying `key`, if any.
    fn find_order_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> impl Future<Output = Result<Option<OrderId>, StoreError>> + Send;
}

/// Product maintenance outside the order path.
pub trait Catalog: Send + Sync {
    /// Insert a product and return its new id.
    fn create_product(
        &self,
        product: NewProduct,
    ) -> impl Future<Output = Result<ProductId, StoreError>> + Send;

    /// Read a product's committed state, `None` when it does not exist.
    fn find_product(
        &self,
        product_id: ProductId,
    ) -> impl Future<Output = Result<Option<Product>, StoreError>> + Send;

    /// Overwrite the stock of a product.
    ///
    /// Takes the same row lock as order placement, so a restock never
    /// interleaves with a reservation of the same product.
    fn set_product_quantity(
        &self,
        product_id: ProductId,
        quantity: StockLevel,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// User registration and lookup.
pub trait UserDirectory: Send + Sync {
    /// Register a user. Fails with `StoreError::DuplicateUser` when the name is taken.
    fn create_user(&self, user: NewUser) -> impl Future<Output = Result<UserId, StoreError>> + Send;

    /// Read a registered user. The password digest is never returned.
    fn find_user(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Option<User>, StoreError>> + Send;
}
