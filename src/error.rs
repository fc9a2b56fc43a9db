//! Error Types
//!
//! Hard failures only. Contention, business-rule and admission outcomes are
//! returned as values by the layers that produce them.

use crate::session::model::PaymentStatus;
use std::io;
use thiserror::Error;

/// Backing store errors (infrastructure faults)
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend-specific failure
    #[error("Backing store error: {0}")]
    Backend(String),
}

/// Result type for backing store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Payment state invariant violation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PaymentValidationError {
    #[error("{field} must be a finite non-negative amount, got {value}")]
    InvalidAmount { field: &'static str, value: f64 },

    #[error("tip percentage must be within 0..=100, got {0}")]
    TipPercentageOutOfRange(f64),

    #[error("tip amount {tip_amount:.2} does not match {tip_percentage}% of tab {tab_total:.2}")]
    TipMismatch {
        tip_amount: f64,
        tip_percentage: f64,
        tab_total: f64,
    },

    #[error("tab total {tab_total:.2} does not match order history total {history_total:.2}")]
    TabMismatch { tab_total: f64, history_total: f64 },

    #[error("balance would become negative: {0:.2}")]
    NegativeBalance(f64),
}

/// Session state errors
#[derive(Error, Debug)]
pub enum StateError {
    /// Unknown section name (programmer error)
    #[error("Section not found: {0}")]
    SectionNotFound(String),

    /// Caller required an existing session
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Partial update does not fit the section's shape
    #[error("Invalid update for section '{section}': {message}")]
    InvalidUpdate { section: String, message: String },

    /// Attempted payment status change that is not allowed
    #[error("Invalid payment status transition: {from} -> {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    /// A scope's order or payment changes were based on a version that has
    /// since been superseded
    #[error("Concurrent modification: expected version {expected}, found {found}")]
    ConcurrentModification { expected: u64, found: u64 },

    /// Payment state would violate an invariant
    #[error("Payment validation failed: {0}")]
    Validation(#[from] PaymentValidationError),

    /// Backing store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for session state operations
pub type StateResult<T> = Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_display() {
        let err = StateError::SectionNotFound("drinks".to_string());
        assert_eq!(format!("{err}"), "Section not found: drinks");

        let err = StateError::InvalidTransition {
            from: PaymentStatus::Paid,
            to: PaymentStatus::Open,
        };
        assert_eq!(format!("{err}"), "Invalid payment status transition: paid -> open");
    }

    #[test]
    fn test_store_error_is_transparent_in_state_error() {
        let err: StateError = StoreError::Backend("unreachable".to_string()).into();
        assert_eq!(format!("{err}"), "Backing store error: unreachable");
    }

    #[test]
    fn test_validation_error_display() {
        let err = PaymentValidationError::TipMismatch {
            tip_amount: 5.0,
            tip_percentage: 20.0,
            tab_total: 12.0,
        };
        assert_eq!(
            format!("{err}"),
            "tip amount 5.00 does not match 20% of tab 12.00"
        );
    }
}
