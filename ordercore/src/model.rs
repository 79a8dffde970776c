//! Records persisted by the stores: products, users, order headers and lines.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::{
    IdempotencyKey, OrderId, Price, ProductDescription, ProductId, ProductTag, Quantity,
    StockLevel, Timestamp, UserId,
};
use crate::users::{Age, FirstName, LastName, Password};

/// A product that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProduct {
    pub description: ProductDescription,
    pub tags: BTreeSet<ProductTag>,
    /// Units on hand.
    pub quantity: StockLevel,
    /// Unit price.
    pub price: Price,
}

/// A stored product row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub description: ProductDescription,
    pub tags: BTreeSet<ProductTag>,
    pub quantity: StockLevel,
    pub price: Price,
}

impl Product {
    /// Attach the identifier the store assigned to `product`.
    pub fn from_new(id: ProductId, product: NewProduct) -> Self {
        Self {
            id,
            description: product.description,
            tags: product.tags,
            quantity: product.quantity,
            price: product.price,
        }
    }
}

/// What a unit of work sees after locking a product row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductStock {
    pub product_id: ProductId,
    /// Stock under the lock, after any decrements made by this unit of work.
    pub available: StockLevel,
    /// Price charged for each unit reserved under this lock.
    pub price: Price,
}

/// Header row written first in an order transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrderHeader {
    pub buyer: UserId,
    pub created_at: Timestamp,
    /// Sum of the line totals as computed under the row locks.
    pub total_price: Price,
    pub idempotency_key: Option<IdempotencyKey>,
}

/// One line of an order being written.
///
/// `position` is the index of the line in the caller's request, so lines can
/// be read back in the order they were asked for even when locks were taken
/// in a different order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewOrderLine {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub position: u32,
    pub quantity: Quantity,
    /// Product price captured while its row was locked.
    pub unit_price: Price,
}

/// A persisted order line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: Quantity,
    pub unit_price: Price,
}

impl OrderLine {
    /// `quantity × unit_price`, or `None` on overflow.
    pub fn line_total(&self) -> Option<Price> {
        self.unit_price.line_total(self.quantity)
    }
}

impl From<NewOrderLine> for OrderLine {
    fn from(line: NewOrderLine) -> Self {
        Self {
            product_id: line.product_id,
            quantity: line.quantity,
            unit_price: line.unit_price,
        }
    }
}

/// A committed order aggregate: header plus lines in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub buyer: UserId,
    pub created_at: Timestamp,
    pub total_price: Price,
    pub idempotency_key: Option<IdempotencyKey>,
    /// Lines in the order they were requested.
    pub lines: Vec<OrderLine>,
}

impl Order {
    /// Sum of the line totals. Equal to `total_price` for every committed order.
    pub fn computed_total(&self) -> Option<Price> {
        self.lines
            .iter()
            .try_fold(Price::zero(), |sum, line| sum.checked_add(line.line_total()?))
    }
}

/// A user registration before the password has been digested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub first_name: FirstName,
    pub last_name: LastName,
    pub age: Age,
    pub is_married: bool,
    /// Plaintext, digested by the store before it is written.
    pub password: Password,
}

/// A stored user. The password digest never leaves the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub first_name: FirstName,
    pub last_name: LastName,
    pub age: Age,
    pub is_married: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn line(product: i64, quantity: i32, unit_price: rust_decimal::Decimal) -> OrderLine {
        OrderLine {
            product_id: ProductId::try_new(product).expect("valid product id"),
            quantity: Quantity::try_new(quantity).expect("valid quantity"),
            unit_price: Price::try_new(unit_price).expect("valid price"),
        }
    }

    #[test]
    fn computed_total_sums_every_line() {
        // Given: an order with two lines
        let order = Order {
            id: OrderId::try_new(1).expect("valid order id"),
            buyer: UserId::try_new(7).expect("valid user id"),
            created_at: Timestamp::now(),
            total_price: Price::try_new(dec!(35.00)).expect("valid price"),
            idempotency_key: None,
            lines: vec![line(1, 3, dec!(10.00)), line(2, 1, dec!(5.00))],
        };

        // When/Then: the computed total is 3 × 10 + 1 × 5
        assert_eq!(
            order.computed_total(),
            Some(Price::try_new(dec!(35.00)).expect("valid price"))
        );
    }
}
