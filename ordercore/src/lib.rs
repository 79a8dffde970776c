//! `OrderCore` - transactional order placement with inventory reservation
//!
//! An order is placed as one unit of work: the order header, its lines and
//! the stock decrements of every product it touches are committed together
//! or not at all. Product rows are locked for the duration of the unit of
//! work, so two concurrent orders can never sell the same unit twice.
//!
//! Storage is pluggable through the traits in [`store`]; `ordercore-memory`
//! and `ordercore-postgres` provide implementations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod model;
pub mod request;
pub mod store;
pub mod types;
pub mod users;
mod validation;

pub use config::{CoordinatorConfig, LockOrdering, OrderTimeoutMs, TotalPolicy};
pub use coordinator::OrderCoordinator;
pub use errors::{ErrorClass, Operation, OrderError, ReferenceKind, StoreError};
pub use model::{
    NewOrderHeader, NewOrderLine, NewProduct, NewUser, Order, OrderLine, Product, ProductStock,
    User,
};
pub use request::{OrderRequest, RequestError, RequestedLine, MAX_ORDER_LINES};
pub use store::{Catalog, InventoryRecords, OrderAggregates, OrderStore, UnitOfWork, UserDirectory};
pub use types::{
    IdempotencyKey, OrderId, Price, ProductDescription, ProductId, ProductTag, Quantity,
    StockLevel, Timestamp, UserId,
};
pub use users::{Age, FirstName, LastName, Password, PasswordDigest};
