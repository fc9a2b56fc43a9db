//! End-to-end conversation tests: each turn is one request through the core
//! (rate limit, admission, request scope, flush).

use std::sync::Arc;
use tabkeeper::clock::ManualClock;
use tabkeeper::resource::FixedMemorySource;
use tabkeeper::session::{LineItem, Phase, SessionState};
use tabkeeper::{Config, FileStore, MemoryStore, PaymentOutcome, SessionCore};
use tempfile::TempDir;

// ============================================================================
// Test Helpers
// ============================================================================

fn create_core() -> SessionCore {
    SessionCore::with_components(
        Config::default(),
        Arc::new(MemoryStore::new()),
        Box::new(FixedMemorySource::default()),
        Arc::new(ManualClock::new()),
    )
}

/// One user turn handled as one request
fn turn<F>(core: &SessionCore, session_id: &str, f: F) -> Phase
where
    F: FnOnce(&mut tabkeeper::RequestScope) -> bool,
{
    let mut scope = core.begin_request(session_id, None).unwrap();
    let placed = f(&mut scope);
    let change = scope.advance_turn(placed).unwrap();
    scope.finish().unwrap();
    change.to
}

// ============================================================================
// Conversation Flow
// ============================================================================

#[test]
fn test_greeting_to_reorder_prompt() {
    let core = create_core();
    let id = "guest";

    assert_eq!(
        core.store().get_session_data(id).unwrap().conversation.phase,
        Phase::Greeting
    );

    assert_eq!(turn(&core, id, |_| false), Phase::OrderTaking);

    let phase = turn(&core, id, |scope| {
        scope.add_item(LineItem::new("Old Fashioned", 12.0)).unwrap();
        scope.place_order().unwrap()
    });
    assert_eq!(phase, Phase::SmallTalk);

    let record = core.store().get_session_data(id).unwrap();
    assert!((record.order.order_history.total_cost - 12.00).abs() < 1e-9);
    assert!(record.order.finished);
    assert!(record.order.current_order.is_empty());

    let phases: Vec<Phase> = (0..4).map(|_| turn(&core, id, |_| false)).collect();
    assert_eq!(
        phases,
        vec![
            Phase::SmallTalk,
            Phase::SmallTalk,
            Phase::SmallTalk,
            Phase::ReorderPrompt
        ]
    );

    // Any answer to the reorder prompt goes back to small talk
    assert_eq!(turn(&core, id, |_| false), Phase::SmallTalk);
    assert_eq!(
        core.store().get_session_data(id).unwrap().conversation.small_talk_count,
        0
    );
}

#[test]
fn test_reorder_then_pay() {
    let core = create_core();
    let id = "regular";

    turn(&core, id, |_| false);
    turn(&core, id, |scope| {
        scope.add_item(LineItem::new("IPA", 7.5)).unwrap();
        scope.place_order().unwrap()
    });
    turn(&core, id, |scope| {
        scope.add_item(LineItem::new("IPA", 7.5)).unwrap();
        scope.add_item(LineItem::new("Pretzel", 5.0)).unwrap();
        scope.set_tip_percentage(20.0).unwrap();
        scope.place_order().unwrap()
    });

    let record = core.store().get_session_data(id).unwrap();
    assert_eq!(record.order.order_history.items.len(), 3);
    assert_eq!(record.payment.tab_total, 20.0);
    assert_eq!(record.payment.tip_amount, 4.0);

    let outcome = core.store().atomic_payment_complete(id);
    assert_eq!(
        outcome,
        PaymentOutcome::Completed {
            charged: 24.0,
            remaining_balance: 976.0,
            version: record.payment.version + 1,
        }
    );
    assert_eq!(core.store().atomic_payment_complete(id), PaymentOutcome::AlreadyPaid);

    // A paid tab stays closed until reset
    let mut scope = core.begin_request(id, None).unwrap();
    assert!(scope.add_item(LineItem::new("IPA", 7.5)).is_err());
    scope.reset().unwrap();
    scope.add_item(LineItem::new("IPA", 7.5)).unwrap();
    scope.finish().unwrap();
    assert_eq!(core.store().get_session_data(id).unwrap().payment.tab_total, 7.5);
}

#[test]
fn test_sessions_are_isolated() {
    let core = create_core();
    turn(&core, "a", |_| false);
    turn(&core, "a", |scope| {
        scope.add_item(LineItem::new("Wine", 9.0)).unwrap();
        scope.place_order().unwrap()
    });

    let b = core.store().get_session_data("b").unwrap();
    assert_eq!(b.conversation.phase, Phase::Greeting);
    assert_eq!(b.payment.tab_total, 0.0);
    assert_eq!(core.stats().admission.live_sessions, 1);
}

#[test]
fn test_conversation_survives_restart_with_file_store() {
    let temp = TempDir::new().unwrap();
    let build = || {
        SessionCore::with_components(
            Config::default(),
            Arc::new(FileStore::open(temp.path()).unwrap()),
            Box::new(FixedMemorySource::default()),
            Arc::new(ManualClock::new()),
        )
    };

    {
        let core = build();
        turn(&core, "durable", |_| false);
        turn(&core, "durable", |scope| {
            scope.add_item(LineItem::new("Stout", 8.0)).unwrap();
            scope.place_order().unwrap()
        });
    }

    let core = build();
    let record = core.store().get_session_data("durable").unwrap();
    assert_eq!(record.conversation.phase, Phase::SmallTalk);
    assert_eq!(record.order.order_history.total_cost, 8.0);
}
