use crate::{error::SyncError, types::ConversationPhase};

/// Tag attached to every fetch so late results can be recognised as stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchTicket {
    pub conversation_id: String,
    pub generation: u64,
}

/// Per-session conversation lifecycle: `Closed -> Loading -> Live -> Closed`.
///
/// Only one conversation is ever Loading or Live. Opening another conversation
/// bumps the generation, which invalidates every ticket issued before.
#[derive(Debug, Clone, Default)]
pub struct ConversationStateMachine {
    phase: ConversationPhase,
    conversation_id: Option<String>,
    generation: u64,
}

impl ConversationStateMachine {
    pub fn phase(&self) -> ConversationPhase {
        self.phase
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Enter Loading for `conversation_id` and return the fetch ticket.
    ///
    /// Any previously open conversation is implicitly closed.
    pub fn begin_open(&mut self, conversation_id: impl Into<String>) -> FetchTicket {
        let conversation_id = conversation_id.into();
        self.generation = self.generation.wrapping_add(1);
        self.phase = ConversationPhase::Loading;
        self.conversation_id = Some(conversation_id.clone());
        FetchTicket {
            conversation_id,
            generation: self.generation,
        }
    }

    /// Loading -> Live after a successful initial fetch.
    pub fn on_loaded(&mut self, ticket: &FetchTicket) -> Result<(), SyncError> {
        if !self.is_current_in(ticket, ConversationPhase::Loading) {
            return Err(SyncError::invalid_state(self.phase, "on_loaded"));
        }
        self.phase = ConversationPhase::Live;
        Ok(())
    }

    /// Loading -> Closed after a failed initial fetch.
    pub fn on_load_failed(&mut self, ticket: &FetchTicket) -> Result<(), SyncError> {
        if !self.is_current_in(ticket, ConversationPhase::Loading) {
            return Err(SyncError::invalid_state(self.phase, "on_load_failed"));
        }
        self.phase = ConversationPhase::Closed;
        self.conversation_id = None;
        Ok(())
    }

    /// Any -> Closed. Returns the conversation that was open, if any.
    pub fn close(&mut self) -> Option<String> {
        if self.phase == ConversationPhase::Closed {
            return None;
        }
        self.generation = self.generation.wrapping_add(1);
        self.phase = ConversationPhase::Closed;
        self.conversation_id.take()
    }

    /// Ticket for a refresh of the Live conversation.
    pub fn live_ticket(&self) -> Option<FetchTicket> {
        if self.phase != ConversationPhase::Live {
            return None;
        }
        self.conversation_id.as_ref().map(|id| FetchTicket {
            conversation_id: id.clone(),
            generation: self.generation,
        })
    }

    /// Whether `ticket` belongs to the current conversation in `phase`.
    pub fn is_current_in(&self, ticket: &FetchTicket, phase: ConversationPhase) -> bool {
        self.phase == phase
            && ticket.generation == self.generation
            && self.conversation_id.as_deref() == Some(ticket.conversation_id.as_str())
    }

    pub fn is_live(&self, conversation_id: &str) -> bool {
        self.phase == ConversationPhase::Live
            && self.conversation_id.as_deref() == Some(conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_happy_path_state_transitions() {
        let mut sm = ConversationStateMachine::default();
        assert_eq!(sm.phase(), ConversationPhase::Closed);

        let ticket = sm.begin_open("c1");
        assert_eq!(sm.phase(), ConversationPhase::Loading);

        sm.on_loaded(&ticket).expect("load should complete");
        assert_eq!(sm.phase(), ConversationPhase::Live);
        assert!(sm.is_live("c1"));

        assert_eq!(sm.close().as_deref(), Some("c1"));
        assert_eq!(sm.phase(), ConversationPhase::Closed);
    }

    #[test]
    fn failed_load_returns_to_closed() {
        let mut sm = ConversationStateMachine::default();
        let ticket = sm.begin_open("c1");
        sm.on_load_failed(&ticket).expect("failure should apply");
        assert_eq!(sm.phase(), ConversationPhase::Closed);
        assert_eq!(sm.conversation_id(), None);
    }

    #[test]
    fn rejects_ticket_from_superseded_open() {
        let mut sm = ConversationStateMachine::default();
        let first = sm.begin_open("a");
        let second = sm.begin_open("b");

        let err = sm.on_loaded(&first).expect_err("stale ticket must be rejected");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(sm.phase(), ConversationPhase::Loading);

        sm.on_loaded(&second).expect("current ticket should apply");
        assert!(sm.is_live("b"));
    }

    #[test]
    fn reopening_same_conversation_invalidates_old_ticket() {
        let mut sm = ConversationStateMachine::default();
        let first = sm.begin_open("a");
        sm.close();
        let _second = sm.begin_open("a");

        assert!(!sm.is_current_in(&first, ConversationPhase::Loading));
    }

    #[test]
    fn close_is_idempotent() {
        let mut sm = ConversationStateMachine::default();
        assert_eq!(sm.close(), None);
        assert_eq!(sm.close(), None);
        assert_eq!(sm.phase(), ConversationPhase::Closed);
    }

    #[test]
    fn live_ticket_only_exists_while_live() {
        let mut sm = ConversationStateMachine::default();
        let ticket = sm.begin_open("c1");
        assert_eq!(sm.live_ticket(), None);
        sm.on_loaded(&ticket).expect("load");
        assert_eq!(sm.live_ticket(), Some(ticket));
    }
}
