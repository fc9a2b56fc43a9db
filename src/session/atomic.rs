//! Atomic Transaction Layer
//!
//! Optimistic read-modify-write over the order and payment sections. A
//! transaction reads a snapshot together with the payment version token,
//! mutates a copy without holding any lock, and commits only if the stored
//! token is still the one it read:
//!
//! ```text
//! lock ─ read {order, payment, version} ─ unlock
//!          mutate copies (no lock held)
//! lock ─ compare version ─┬─ equal:   validate, bump version, persist
//!                         └─ changed: ConcurrentModification, nothing written
//! unlock
//! ```
//!
//! Conflicts and business-rule outcomes come back as values. Only backing
//! store faults and invariant violations are errors.

use super::model::{
    round_cents, OrderState, PaymentState, PaymentStatus, SessionRecord, CENT_TOLERANCE,
};
use super::ops::{check_order_totals, sync_tab};
use super::store::SessionStore;
use crate::error::{PaymentValidationError, StateResult};
use serde::Serialize;
use std::sync::atomic::Ordering;

/// Order and payment sections as read at one version
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSnapshot {
    pub order: OrderState,
    pub payment: PaymentState,
    pub version: u64,
}

/// Result of an optimistic order update
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome<T> {
    Committed { value: T, version: u64 },
    /// Another writer committed since the snapshot was read. Nothing was
    /// written; the caller may retry.
    ConcurrentModification { expected: u64, found: u64 },
    /// The update would move the tab along an illegal status edge
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },
}

impl<T> UpdateOutcome<T> {
    pub fn is_committed(&self) -> bool {
        matches!(self, UpdateOutcome::Committed { .. })
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            UpdateOutcome::Committed { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Result of settling a tab
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Completed {
        charged: f64,
        remaining_balance: f64,
        version: u64,
    },
    InsufficientFunds {
        balance: f64,
        total_due: f64,
    },
    AlreadyPaid,
    NothingToPay,
    /// Unexpected failure while reading or writing state
    Failed {
        reason: String,
    },
}

impl PaymentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PaymentOutcome::Completed { .. })
    }
}

/// Only an open tab may change: `open -> open` (editing) and `open -> paid`.
pub fn is_valid_status_transition(from: PaymentStatus, to: PaymentStatus) -> bool {
    matches!(
        (from, to),
        (PaymentStatus::Open, PaymentStatus::Open) | (PaymentStatus::Open, PaymentStatus::Paid)
    )
}

/// Check the payment invariants, including that the tab matches the order
/// history it bills.
pub fn validate_payment_state(
    payment: &PaymentState,
    order: &OrderState,
) -> Result<(), PaymentValidationError> {
    payment.validate()?;
    let history_total = order.order_history.total_cost;
    if (payment.tab_total - history_total).abs() > CENT_TOLERANCE {
        return Err(PaymentValidationError::TabMismatch {
            tab_total: payment.tab_total,
            history_total,
        });
    }
    Ok(())
}

impl SessionStore {
    /// Read the order and payment sections with their version token
    pub fn read_order_snapshot(&self, session_id: &str) -> StateResult<OrderSnapshot> {
        let _guard = self.locks().lock(session_id);
        let record = self.load_or_default(session_id)?;
        Ok(OrderSnapshot {
            version: record.payment.version,
            order: record.order,
            payment: record.payment,
        })
    }

    /// Write `order` and `payment` back if the stored version still equals
    /// `expected_version`.
    ///
    /// Derived totals are recomputed from the order history before the
    /// invariants are checked.
    pub fn commit_order_snapshot(
        &self,
        session_id: &str,
        expected_version: u64,
        order: OrderState,
        payment: PaymentState,
    ) -> StateResult<UpdateOutcome<()>> {
        let _guard = self.locks().lock(session_id);
        let mut record = self.load_or_default(session_id)?;

        let found = record.payment.version;
        if found != expected_version {
            self.counters
                .concurrent_modifications
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                session_id = %session_id,
                expected = expected_version,
                found,
                "concurrent_modification"
            );
            return Ok(UpdateOutcome::ConcurrentModification {
                expected: expected_version,
                found,
            });
        }

        let from = record.order.status();
        let to = order.status();
        if !is_valid_status_transition(from, to) {
            return Ok(UpdateOutcome::InvalidTransition { from, to });
        }

        apply_order_update(&mut record, order, payment)?;
        let version = record.bump_version();
        self.persist(session_id, &record)?;
        Ok(UpdateOutcome::Committed { value: (), version })
    }

    /// Apply `mutate` to copies of the order and payment sections and commit
    /// them if nobody else wrote in between.
    pub fn atomic_order_update<T, F>(&self, session_id: &str, mutate: F) -> StateResult<UpdateOutcome<T>>
    where
        F: FnOnce(&mut OrderState, &mut PaymentState) -> T,
    {
        let OrderSnapshot {
            mut order,
            mut payment,
            version,
        } = self.read_order_snapshot(session_id)?;

        let value = mutate(&mut order, &mut payment);

        Ok(
            match self.commit_order_snapshot(session_id, version, order, payment)? {
                UpdateOutcome::Committed { version, .. } => UpdateOutcome::Committed { value, version },
                UpdateOutcome::ConcurrentModification { expected, found } => {
                    UpdateOutcome::ConcurrentModification { expected, found }
                }
                UpdateOutcome::InvalidTransition { from, to } => {
                    UpdateOutcome::InvalidTransition { from, to }
                }
            },
        )
    }

    /// Settle the tab: charge tab plus tip against the balance and mark the
    /// order paid, all under the session lock.
    ///
    /// Never fails with an error; unexpected faults are reported as
    /// [`PaymentOutcome::Failed`].
    pub fn atomic_payment_complete(&self, session_id: &str) -> PaymentOutcome {
        let outcome = match self.settle(session_id) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "payment_failed");
                PaymentOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        match &outcome {
            PaymentOutcome::Completed {
                charged,
                remaining_balance,
                ..
            } => {
                self.counters
                    .payments_completed
                    .fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    session_id = %session_id,
                    charged,
                    remaining_balance,
                    "payment_completed"
                );
            }
            PaymentOutcome::InsufficientFunds { balance, total_due } => {
                self.counters
                    .payments_rejected
                    .fetch_add(1, Ordering::Relaxed);
                tracing::info!(session_id = %session_id, balance, total_due, "insufficient_funds");
            }
            _ => {}
        }
        outcome
    }

    fn settle(&self, session_id: &str) -> StateResult<PaymentOutcome> {
        let _guard = self.locks().lock(session_id);
        let mut record = self.load_or_default(session_id)?;

        let from = record.order.status();
        if !is_valid_status_transition(from, PaymentStatus::Paid) {
            return Ok(PaymentOutcome::AlreadyPaid);
        }
        if record.order.order_history.items.is_empty() {
            return Ok(PaymentOutcome::NothingToPay);
        }
        validate_payment_state(&record.payment, &record.order)?;

        let payment = &mut record.payment;
        let total_due = payment.tab_total + payment.tip_amount;
        if payment.balance < total_due {
            return Ok(PaymentOutcome::InsufficientFunds {
                balance: payment.balance,
                total_due,
            });
        }

        let charged = payment.total_due();
        payment.balance = round_cents(payment.balance - total_due).max(0.0);
        let remaining_balance = payment.balance;
        record.order.current_order.clear();
        record.order.finished = true;
        record.order.order_history.paid = true;
        let version = record.bump_version();
        self.persist(session_id, &record)?;

        Ok(PaymentOutcome::Completed {
            charged,
            remaining_balance,
            version,
        })
    }
}

fn apply_order_update(
    record: &mut SessionRecord,
    order: OrderState,
    payment: PaymentState,
) -> StateResult<()> {
    let version = record.payment.version;
    record.order = order;
    record.payment = PaymentState { version, ..payment };
    sync_tab(record);
    check_order_totals(&record.order)?;
    validate_payment_state(&record.payment, &record.order)?;
    Ok(())
}
