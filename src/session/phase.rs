//! Conversation phase state machine
//!
//! ```text
//! greeting ──> order_taking ──(order placed)──> small_talk <──> reorder_prompt
//! ```
//!
//! Evaluated once per turn. There is no terminal state: after the first
//! order the machine cycles between small talk and the reorder prompt for
//! the life of the session, dropping back into small talk whenever another
//! order is placed.

use super::model::{ConversationState, Phase};

/// Small-talk turns before the reorder prompt
pub const SMALL_TALK_THRESHOLD: u32 = 4;

/// Phase change produced by one turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseChange {
    pub from: Phase,
    pub to: Phase,
    pub turn: u64,
}

impl PhaseChange {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Advance the conversation by one turn.
pub fn advance_turn(state: &mut ConversationState, order_placed: bool) -> PhaseChange {
    let from = state.phase;
    state.turn_count += 1;

    let to = match from {
        Phase::Greeting => Phase::OrderTaking,
        _ if order_placed => {
            state.small_talk_count = 0;
            Phase::SmallTalk
        }
        Phase::OrderTaking => Phase::OrderTaking,
        Phase::SmallTalk => {
            state.small_talk_count += 1;
            if state.small_talk_count >= SMALL_TALK_THRESHOLD {
                Phase::ReorderPrompt
            } else {
                Phase::SmallTalk
            }
        }
        Phase::ReorderPrompt => {
            state.small_talk_count = 0;
            Phase::SmallTalk
        }
    };

    if from == Phase::SmallTalk && to != Phase::SmallTalk {
        state.small_talk_count = 0;
    }
    state.phase = to;

    PhaseChange {
        from,
        to,
        turn: state.turn_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_in(phase: Phase) -> ConversationState {
        ConversationState {
            phase,
            ..Default::default()
        }
    }

    #[test]
    fn test_greeting_always_moves_to_order_taking() {
        let mut state = ConversationState::default();
        let change = advance_turn(&mut state, false);
        assert_eq!(change.to, Phase::OrderTaking);
        assert_eq!(state.turn_count, 1);

        let mut state = ConversationState::default();
        assert_eq!(advance_turn(&mut state, true).to, Phase::OrderTaking);
    }

    #[test]
    fn test_order_taking_stays_until_order() {
        let mut state = state_in(Phase::OrderTaking);
        for _ in 0..10 {
            assert_eq!(advance_turn(&mut state, false).to, Phase::OrderTaking);
        }
        assert_eq!(advance_turn(&mut state, true).to, Phase::SmallTalk);
        assert_eq!(state.small_talk_count, 0);
    }

    #[test]
    fn test_small_talk_threshold_moves_to_reorder_prompt() {
        let mut state = state_in(Phase::SmallTalk);
        for expected in 1..SMALL_TALK_THRESHOLD {
            assert_eq!(advance_turn(&mut state, false).to, Phase::SmallTalk);
            assert_eq!(state.small_talk_count, expected);
        }
        let change = advance_turn(&mut state, false);
        assert_eq!(change.to, Phase::ReorderPrompt);
        assert!(change.changed());
        assert_eq!(state.small_talk_count, 0);
    }

    #[test]
    fn test_reorder_prompt_returns_to_small_talk() {
        let mut state = state_in(Phase::ReorderPrompt);
        state.small_talk_count = 3;
        assert_eq!(advance_turn(&mut state, false).to, Phase::SmallTalk);
        assert_eq!(state.small_talk_count, 0);
    }

    #[test]
    fn test_order_during_small_talk_resets_counter() {
        let mut state = state_in(Phase::SmallTalk);
        state.small_talk_count = 2;
        let change = advance_turn(&mut state, true);
        assert_eq!(change.to, Phase::SmallTalk);
        assert!(!change.changed());
        assert_eq!(state.small_talk_count, 0);
    }

    #[test]
    fn test_machine_cycles_without_terminal_state() {
        let mut state = state_in(Phase::SmallTalk);
        let mut seen_prompt = 0;
        for _ in 0..50 {
            if advance_turn(&mut state, false).to == Phase::ReorderPrompt {
                seen_prompt += 1;
            }
        }
        assert_eq!(seen_prompt, 10);
    }
}
