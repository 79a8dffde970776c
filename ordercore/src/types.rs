//! Core types for the `OrderCore` order placement library.
//!
//! Identifiers, quantities and prices are nutype wrappers with smart
//! constructors, following the "parse, don't validate" principle: once a
//! `Quantity` exists it is positive, once a `Price` exists it is not negative.

use chrono::{DateTime, Utc};
use nutype::nutype;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::validation::{is_non_negative, no_control_characters};

/// Identifier of a registered user (the buyer of an order).
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct UserId(i64);

/// Identifier of a product row.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct ProductId(i64);

/// Identifier assigned to an order when its header is inserted.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct OrderId(i64);

/// Number of units requested on an order line. Always at least one.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct Quantity(i32);

/// Units of a product currently on hand. Never negative.
#[nutype(
    validate(greater_or_equal = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct StockLevel(i32);

impl StockLevel {
    /// Returns true when at least `requested` units are on hand.
    pub fn covers(self, requested: Quantity) -> bool {
        self.into_inner() >= requested.into_inner()
    }

    /// Stock left after handing out `amount` units, or `None` if that would go negative.
    pub fn checked_sub(self, amount: Quantity) -> Option<Self> {
        self.into_inner()
            .checked_sub(amount.into_inner())
            .and_then(|remaining| Self::try_new(remaining).ok())
    }
}

/// A non-negative monetary amount.
///
/// Used both for product list prices and for order totals. Arithmetic is
/// checked; an overflow surfaces as `None` instead of wrapping.
#[nutype(
    validate(predicate = is_non_negative),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct Price(Decimal);

impl Price {
    /// The zero amount.
    pub fn zero() -> Self {
        Self::try_new(Decimal::ZERO).expect("zero is always a valid price")
    }

    /// `self × quantity`, the cost of one order line.
    pub fn line_total(self, quantity: Quantity) -> Option<Self> {
        self.into_inner()
            .checked_mul(Decimal::from(quantity.into_inner()))
            .and_then(|total| Self::try_new(total).ok())
    }

    /// `self + other`.
    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.into_inner()
            .checked_add(other.into_inner())
            .and_then(|total| Self::try_new(total).ok())
    }

    /// Compares amounts by value, ignoring scale (`30` equals `30.00`).
    pub fn same_amount(self, other: Self) -> bool {
        self.into_inner().normalize() == other.into_inner().normalize()
    }
}

/// Caller-supplied token that makes order creation safe to retry.
///
/// Two requests carrying the same key create at most one order; the second
/// one receives the identifier of the first.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128, predicate = no_control_characters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct IdempotencyKey(String);

/// Free-text product description.
#[nutype(
    sanitize(trim),
    validate(len_char_max = 1000),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ProductDescription(String);

/// A single product tag such as `"outdoor"`.
#[nutype(
    sanitize(trim, lowercase),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ProductTag(String);

/// A timestamp for when an order was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
