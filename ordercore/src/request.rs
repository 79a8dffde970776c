//! Order placement requests and their validation.

use std::collections::HashSet;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{IdempotencyKey, Price, ProductId, Quantity, UserId};

/// Problems found in a request before any store is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The order has no lines.
    #[error("order must contain at least one line")]
    EmptyOrder,

    /// A line asks for zero or fewer units.
    #[error("line for product {product_id} has non-positive quantity {quantity}")]
    NonPositiveQuantity { product_id: i64, quantity: i32 },

    /// An identifier is zero or negative.
    #[error("{kind} id {id} is not a positive integer")]
    InvalidId { kind: &'static str, id: i64 },

    /// The caller declared a negative total.
    #[error("declared total {0} is negative")]
    NegativeTotal(Decimal),

    /// The line totals do not fit in a decimal.
    #[error("order total overflows")]
    TotalOverflow,

    /// The idempotency key is blank, too long or contains control characters.
    #[error("idempotency key is invalid")]
    InvalidIdempotencyKey,

    /// More lines than one order may carry.
    #[error("order has {count} lines, at most {max} are allowed", max = MAX_ORDER_LINES)]
    TooManyLines { count: usize },
}

/// Upper bound on the number of lines in one order.
pub const MAX_ORDER_LINES: usize = 1_000;

/// One product/quantity pair of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestedLine {
    pub product_id: ProductId,
    pub quantity: Quantity,
}

/// A validated request to place an order.
///
/// Always has at least one line. Duplicate products are allowed here and
/// rejected by the coordinator, which reports them as a conflict rather than
/// a malformed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    buyer: UserId,
    lines: Vec<RequestedLine>,
    declared_total: Option<Price>,
    idempotency_key: Option<IdempotencyKey>,
}

impl OrderRequest {
    /// Build a request from already-typed parts.
    pub fn new(
        buyer: UserId,
        lines: Vec<RequestedLine>,
        declared_total: Option<Price>,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<Self, RequestError> {
        if lines.is_empty() {
            return Err(RequestError::EmptyOrder);
        }
        if lines.len() > MAX_ORDER_LINES {
            return Err(RequestError::TooManyLines { count: lines.len() });
        }
        Ok(Self {
            buyer,
            lines,
            declared_total,
            idempotency_key,
        })
    }

    /// Parse raw integers and a decimal total into a request.
    ///
    /// The first invalid value wins: buyer id, then each line in order, then
    /// the declared total.
    pub fn from_raw(
        buyer_id: i64,
        lines: &[(i64, i32)],
        declared_total: Option<Decimal>,
    ) -> Result<Self, RequestError> {
        let buyer = UserId::try_new(buyer_id).map_err(|_| RequestError::InvalidId {
            kind: "buyer",
            id: buyer_id,
        })?;

        let lines = lines
            .iter()
            .map(|&(product_id, quantity)| {
                let product = ProductId::try_new(product_id).map_err(|_| {
                    RequestError::InvalidId {
                        kind: "product",
                        id: product_id,
                    }
                })?;
                let quantity = Quantity::try_new(quantity).map_err(|_| {
                    RequestError::NonPositiveQuantity {
                        product_id,
                        quantity,
                    }
                })?;
                Ok(RequestedLine {
                    product_id: product,
                    quantity,
                })
            })
            .collect::<Result<Vec<_>, RequestError>>()?;

        let declared_total = declared_total
            .map(|total| Price::try_new(total).map_err(|_| RequestError::NegativeTotal(total)))
            .transpose()?;

        Self::new(buyer, lines, declared_total, None)
    }

    /// Attach an idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    /// Parse and attach a raw idempotency key.
    pub fn with_raw_idempotency_key(self, key: &str) -> Result<Self, RequestError> {
        let key = IdempotencyKey::try_new(key).map_err(|_| RequestError::InvalidIdempotencyKey)?;
        Ok(self.with_idempotency_key(key))
    }

    /// The ordering user.
    pub fn buyer(&self) -> UserId {
        self.buyer
    }

    /// Lines in the order the caller gave them.
    pub fn lines(&self) -> &[RequestedLine] {
        &self.lines
    }

    /// Total the caller expects to pay, if they stated one.
    pub fn declared_total(&self) -> Option<Price> {
        self.declared_total
    }

    /// Key that deduplicates retries of this request.
    pub fn idempotency_key(&self) -> Option<&IdempotencyKey> {
        self.idempotency_key.as_ref()
    }

    /// The first product that appears on more than one line, if any.
    pub fn first_duplicate_product(&self) -> Option<ProductId> {
        let mut seen = HashSet::with_capacity(self.lines.len());
        self.lines
            .iter()
            .map(|line| line.product_id)
            .find(|product| !seen.insert(*product))
    }
}
