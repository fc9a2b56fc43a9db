//! Session operations shared by direct store access and request scopes.
//!
//! Implementors supply a snapshot read and a transactional modify; every
//! domain operation (ordering, tipping, turn advancement, reset) is written
//! once on top of those two.

use super::model::{
    round_cents, ConversationState, CredentialState, LineItem, OrderState, PaymentState,
    PaymentStatus, SessionRecord, Section, CENT_TOLERANCE,
};
use super::atomic::validate_payment_state;
use super::phase::{self, PhaseChange};
use crate::error::{StateError, StateResult};

pub trait SessionState {
    fn session_id(&self) -> &str;

    /// Opening balance used when a section is reset
    fn default_balance(&self) -> f64;

    /// Deep copy of the current record (initialized with defaults if absent)
    fn snapshot(&mut self) -> StateResult<SessionRecord>;

    /// Apply `f` to a copy of the record and keep the result only if `f`
    /// succeeds.
    fn modify<T, F>(&mut self, f: F) -> StateResult<T>
    where
        F: FnOnce(&mut SessionRecord) -> StateResult<T>;

    fn get_session_data(&mut self) -> StateResult<SessionRecord> {
        self.snapshot()
    }

    /// Read one section by name as a JSON object
    fn get_section(&mut self, name: &str) -> StateResult<serde_json::Value> {
        let section: Section = name.parse()?;
        self.snapshot()?.section_value(section)
    }

    /// Merge a partial JSON object into one section
    fn update_section(&mut self, name: &str, partial: &serde_json::Value) -> StateResult<()> {
        let section: Section = name.parse()?;
        self.modify(|record| {
            record.merge_section(section, partial)?;
            if section.is_versioned() {
                check_order_totals(&record.order)?;
                validate_payment_state(&record.payment, &record.order)?;
                record.bump_version();
            }
            Ok(())
        })
    }

    fn conversation(&mut self) -> StateResult<ConversationState> {
        Ok(self.snapshot()?.conversation)
    }

    fn order(&mut self) -> StateResult<OrderState> {
        Ok(self.snapshot()?.order)
    }

    fn payment(&mut self) -> StateResult<PaymentState> {
        Ok(self.snapshot()?.payment)
    }

    /// Add an item to the current order and the open tab
    fn add_item(&mut self, item: LineItem) -> StateResult<OrderState> {
        validate_item(&item)?;
        let session_id = self.session_id().to_string();
        let order = self.modify(|record| {
            ensure_open(&record.order)?;
            record.order.current_order.push(item.clone());
            record.order.order_history.items.push(item.clone());
            record.order.finished = false;
            sync_tab(record);
            record.payment.validate()?;
            record.bump_version();
            Ok(record.order.clone())
        })?;
        tracing::debug!(
            session_id = %session_id,
            item = %item.name,
            total_cost = order.order_history.total_cost,
            "item_added"
        );
        Ok(order)
    }

    /// Close the current order. Returns true if it held any items.
    ///
    /// History is untouched; repeating the call only re-asserts `finished`.
    fn place_order(&mut self) -> StateResult<bool> {
        let placed = self.modify(|record| {
            let placed = !record.order.current_order.is_empty();
            record.order.current_order.clear();
            record.order.finished = true;
            if placed {
                record.conversation.last_order_time = Some(record.conversation.turn_count);
                record.conversation.small_talk_count = 0;
            }
            record.bump_version();
            Ok(placed)
        })?;
        if placed {
            tracing::debug!(session_id = %self.session_id(), "order_placed");
        }
        Ok(placed)
    }

    /// Drop the in-progress order and reopen ordering
    fn clear_order(&mut self) -> StateResult<()> {
        self.modify(|record| {
            record.order.current_order.clear();
            record.order.finished = false;
            record.bump_version();
            Ok(())
        })
    }

    /// Tip as a percentage of the tab; the amount follows the tab from now on
    fn set_tip_percentage(&mut self, percentage: f64) -> StateResult<PaymentState> {
        self.modify(|record| {
            ensure_open(&record.order)?;
            record.payment.tip_percentage = Some(percentage);
            record.payment.refresh_tip();
            mirror_tip(record);
            record.payment.validate()?;
            record.bump_version();
            Ok(record.payment.clone())
        })
    }

    /// Fixed tip amount; clears any percentage
    fn set_tip_amount(&mut self, amount: f64) -> StateResult<PaymentState> {
        self.modify(|record| {
            ensure_open(&record.order)?;
            record.payment.tip_percentage = None;
            record.payment.tip_amount = round_cents(amount);
            mirror_tip(record);
            record.payment.validate()?;
            record.bump_version();
            Ok(record.payment.clone())
        })
    }

    /// Run the phase machine for one turn
    fn advance_turn(&mut self, order_placed: bool) -> StateResult<PhaseChange> {
        let change = self.modify(|record| Ok(phase::advance_turn(&mut record.conversation, order_placed)))?;
        if change.changed() {
            tracing::debug!(
                session_id = %self.session_id(),
                from = %change.from,
                to = %change.to,
                turn = change.turn,
                "phase_changed"
            );
        }
        Ok(change)
    }

    fn store_credentials(&mut self, material: String, validated: bool) -> StateResult<()> {
        self.modify(|record| {
            record.credentials = CredentialState {
                material: Some(material),
                validated,
            };
            Ok(())
        })
    }

    fn credentials(&mut self) -> StateResult<CredentialState> {
        Ok(self.snapshot()?.credentials)
    }

    /// Restore every section to its defaults.
    ///
    /// The version token keeps counting so an in-flight optimistic update
    /// cannot commit over a reset.
    fn reset(&mut self) -> StateResult<()> {
        let balance = self.default_balance();
        self.modify(|record| {
            let version = record.payment.version;
            *record = SessionRecord::new(balance);
            record.payment.version = version + 1;
            Ok(())
        })?;
        tracing::info!(session_id = %self.session_id(), "session_reset");
        Ok(())
    }
}

/// Recompute history total, tab and tip after the item list changed
pub(crate) fn sync_tab(record: &mut SessionRecord) {
    let total = record.order.order_history.items_total();
    record.order.order_history.total_cost = total;
    record.payment.tab_total = total;
    record.payment.refresh_tip();
    mirror_tip(record);
}

fn mirror_tip(record: &mut SessionRecord) {
    record.order.order_history.tip_amount = record.payment.tip_amount;
    record.order.order_history.tip_percentage = record.payment.tip_percentage;
}

fn ensure_open(order: &OrderState) -> StateResult<()> {
    match order.status() {
        PaymentStatus::Open => Ok(()),
        PaymentStatus::Paid => Err(StateError::InvalidTransition {
            from: PaymentStatus::Paid,
            to: PaymentStatus::Open,
        }),
    }
}

fn validate_item(item: &LineItem) -> StateResult<()> {
    let invalid = |message: &str| StateError::InvalidUpdate {
        section: Section::Order.to_string(),
        message: message.to_string(),
    };
    if item.name.trim().is_empty() {
        return Err(invalid("item name cannot be empty"));
    }
    if !item.unit_price.is_finite() || item.unit_price < 0.0 {
        return Err(invalid("unit price must be a finite non-negative amount"));
    }
    if item.quantity == 0 {
        return Err(invalid("quantity must be at least 1"));
    }
    Ok(())
}

/// History total must equal the sum of its line prices
pub(crate) fn check_order_totals(order: &OrderState) -> StateResult<()> {
    let expected = order.order_history.items_total();
    if (expected - order.order_history.total_cost).abs() > CENT_TOLERANCE {
        return Err(StateError::InvalidUpdate {
            section: Section::Order.to_string(),
            message: format!(
                "total_cost {:.2} does not match item sum {expected:.2}",
                order.order_history.total_cost
            ),
        });
    }
    if order.finished && !order.current_order.is_empty() {
        return Err(StateError::InvalidUpdate {
            section: Section::Order.to_string(),
            message: "a finished order cannot have pending items".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal in-memory implementor for exercising the provided methods
    struct Plain {
        record: SessionRecord,
    }

    impl SessionState for Plain {
        fn session_id(&self) -> &str {
            "plain"
        }

        fn default_balance(&self) -> f64 {
            100.0
        }

        fn snapshot(&mut self) -> StateResult<SessionRecord> {
            Ok(self.record.clone())
        }

        fn modify<T, F>(&mut self, f: F) -> StateResult<T>
        where
            F: FnOnce(&mut SessionRecord) -> StateResult<T>,
        {
            let mut working = self.record.clone();
            let out = f(&mut working)?;
            self.record = working;
            Ok(out)
        }
    }

    fn plain() -> Plain {
        Plain {
            record: SessionRecord::new(100.0),
        }
    }

    #[test]
    fn test_add_item_updates_tab_and_history() {
        let mut s = plain();
        s.add_item(LineItem::new("Martini", 12.0)).unwrap();
        s.add_item(LineItem::new("Fries", 4.5).with_quantity(2)).unwrap();

        let order = s.order().unwrap();
        assert_eq!(order.current_order.len(), 2);
        assert_eq!(order.order_history.total_cost, 21.0);
        assert_eq!(s.payment().unwrap().tab_total, 21.0);
        assert_eq!(s.payment().unwrap().version, 2);
    }

    #[test]
    fn test_add_item_rejects_invalid_items() {
        let mut s = plain();
        assert!(s.add_item(LineItem::new("", 1.0)).is_err());
        assert!(s.add_item(LineItem::new("Water", -1.0)).is_err());
        assert!(s.add_item(LineItem::new("Water", 1.0).with_quantity(0)).is_err());
        assert!(s.order().unwrap().order_history.items.is_empty());
    }

    #[test]
    fn test_place_order_is_idempotent_on_history() {
        let mut s = plain();
        s.add_item(LineItem::new("Beer", 6.0)).unwrap();
        assert!(s.place_order().unwrap());
        assert!(!s.place_order().unwrap());

        let order = s.order().unwrap();
        assert!(order.finished);
        assert!(order.current_order.is_empty());
        assert_eq!(order.order_history.items.len(), 1);
    }

    #[test]
    fn test_clear_order_reopens_without_touching_history() {
        let mut s = plain();
        s.add_item(LineItem::new("Beer", 6.0)).unwrap();
        s.place_order().unwrap();
        s.clear_order().unwrap();

        let order = s.order().unwrap();
        assert!(!order.finished);
        assert_eq!(order.order_history.items.len(), 1);
    }

    #[test]
    fn test_tip_percentage_follows_tab() {
        let mut s = plain();
        s.add_item(LineItem::new("Wine", 20.0)).unwrap();
        s.set_tip_percentage(20.0).unwrap();
        assert_eq!(s.payment().unwrap().tip_amount, 4.0);

        s.add_item(LineItem::new("Wine", 20.0)).unwrap();
        let payment = s.payment().unwrap();
        assert_eq!(payment.tip_amount, 8.0);
        assert_eq!(s.order().unwrap().order_history.tip_amount, 8.0);
    }

    #[test]
    fn test_tip_percentage_out_of_range_is_rejected() {
        let mut s = plain();
        let err = s.set_tip_percentage(150.0).unwrap_err();
        assert!(matches!(err, StateError::Validation(_)));
        assert_eq!(s.payment().unwrap().tip_percentage, None);
    }

    #[test]
    fn test_fixed_tip_clears_percentage() {
        let mut s = plain();
        s.add_item(LineItem::new("Wine", 20.0)).unwrap();
        s.set_tip_percentage(10.0).unwrap();
        let payment = s.set_tip_amount(5.0).unwrap();
        assert_eq!(payment.tip_percentage, None);
        assert_eq!(payment.tip_amount, 5.0);
    }

    #[test]
    fn test_paid_tab_rejects_new_items() {
        let mut s = plain();
        s.record.order.order_history.paid = true;
        let err = s.add_item(LineItem::new("Beer", 6.0)).unwrap_err();
        assert!(matches!(
            err,
            StateError::InvalidTransition {
                from: PaymentStatus::Paid,
                to: PaymentStatus::Open
            }
        ));
    }

    #[test]
    fn test_update_section_unknown_name() {
        let mut s = plain();
        let err = s
            .update_section("drinks", &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, StateError::SectionNotFound(_)));
    }

    #[test]
    fn test_update_section_rejects_inconsistent_totals() {
        let mut s = plain();
        s.add_item(LineItem::new("Beer", 6.0)).unwrap();
        let err = s
            .update_section(
                "order",
                &serde_json::json!({"order_history": {
                    "items": [], "total_cost": 6.0, "tip_amount": 0.0,
                    "tip_percentage": null, "paid": false
                }}),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidUpdate { .. }));
        assert_eq!(s.order().unwrap().order_history.items.len(), 1);
    }

    #[test]
    fn test_reset_restores_defaults_and_advances_version() {
        let mut s = plain();
        s.add_item(LineItem::new("Beer", 6.0)).unwrap();
        s.advance_turn(false).unwrap();
        let before = s.payment().unwrap().version;

        s.reset().unwrap();
        let record = s.snapshot().unwrap();
        assert_eq!(record.conversation, ConversationState::default());
        assert_eq!(record.order, OrderState::default());
        assert_eq!(record.payment.balance, 100.0);
        assert_eq!(record.payment.version, before + 1);
    }
}
