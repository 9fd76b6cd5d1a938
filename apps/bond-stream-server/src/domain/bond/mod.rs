//! Bond Data Model
//!
//! Core domain types for the update pipeline: the raw bond as delivered by
//! the inventory feed, the enriched bond produced by the analytics stage,
//! and the change notification republished by the cache stage.
//!
//! # Serialized contract
//!
//! `EnrichedBond` serializes to a flat camelCase JSON object
//! (`id`, `price`, `faceValue`, ..., `yieldToMaturity`, `lastUpdated`).
//! The field names and casing are an external contract with stream and
//! snapshot consumers and must not change. The `serialized_contract` test
//! below locks them in.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Raw Bond
// =============================================================================

/// A raw bond update as delivered by the inventory feed.
///
/// Prices are quoted in integer currency units. Each arrival through the
/// pipeline is treated as an independent immutable snapshot of the bond.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bond {
    /// Globally unique identifier, immutable once assigned.
    pub id: String,
    /// Current market price.
    pub price: i64,
    /// Face (par) value.
    pub face_value: i64,
    /// Annual coupon payment.
    pub coupon: i64,
    /// Days until maturity.
    #[serde(rename = "duration")]
    pub duration_days: i64,
}

// =============================================================================
// Enriched Bond
// =============================================================================

/// A bond plus the analytics derived from its current price.
///
/// Produced fresh for every raw update by the analytics stage; never mutated
/// after creation. A newer enrichment for the same id supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedBond {
    /// Bond identifier.
    pub id: String,
    /// Current market price.
    pub price: i64,
    /// Face (par) value.
    pub face_value: i64,
    /// Annual coupon payment.
    pub coupon: i64,
    /// Days until maturity.
    #[serde(rename = "duration")]
    pub duration_days: i64,
    /// Current yield (coupon / price).
    #[serde(rename = "yield")]
    pub current_yield: f64,
    /// Approximate yield to maturity.
    pub yield_to_maturity: f64,
    /// Approximate modified duration in years.
    pub modified_duration: f64,
    /// Dollar duration (price sensitivity per 100bp).
    pub dollar_duration: f64,
    /// Approximate convexity.
    pub convexity: f64,
    /// When this enrichment was computed.
    pub last_updated: DateTime<Utc>,
}

// =============================================================================
// Change Notification
// =============================================================================

/// Change notification republished by the cache stage after each upsert.
///
/// Carries the id and a refcounted copy of the just-written serialized
/// state, so downstream stages hold no reference into cache memory.
#[derive(Debug, Clone)]
pub struct BondUpdate {
    /// Identifier of the bond that changed.
    pub bond_id: String,
    /// Serialized latest state at the time of the update.
    pub serialized: Arc<str>,
}

// =============================================================================
// Tests
// =============================================================================
