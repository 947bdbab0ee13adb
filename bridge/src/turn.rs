//! Caller turn tracking.
//!
//! The detector is deliberately naive: the telephony side suppresses comfort
//! noise, so the mere presence or absence of inbound frames is the speech
//! signal. The tracker only decides whether a frame arriving now may open a
//! turn and whether agent audio cancels one; the actual silence and hard-cap
//! deadlines live with the call, which calls back into [`TurnTracker::exit`].

use std::time::{Duration, Instant};

/// Agent output more recent than this blocks a new caller turn.
pub const AGENT_COOLDOWN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Speaking,
}

#[derive(Debug)]
pub struct TurnTracker {
    state: TurnState,
    last_agent_output: Option<Instant>,
    agent_has_spoken: bool,
}

impl Default for TurnTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnTracker {
    pub fn new() -> Self {
        Self {
            state: TurnState::Idle,
            last_agent_output: None,
            agent_has_spoken: false,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.state == TurnState::Speaking
    }

    pub fn agent_has_spoken(&self) -> bool {
        self.agent_has_spoken
    }

    /// Whether a caller frame arriving at `now` may open a new turn: we must
    /// be idle, and either the agent has never spoken, its socket is not
    /// open, or its last output is older than the cooldown.
    pub fn may_enter(&self, now: Instant, agent_open: bool) -> bool {
        self.state == TurnState::Idle
            && (!agent_open
                || !self.agent_has_spoken
                || self
                    .last_agent_output
                    .is_none_or(|t| now.duration_since(t) > AGENT_COOLDOWN))
    }

    pub fn enter(&mut self) {
        self.state = TurnState::Speaking;
    }

    /// Close an open turn. Returns `false` when already idle, so double
    /// exits (silence firing after the hard cap, a stop after either) are
    /// no-ops.
    pub fn exit(&mut self) -> bool {
        let was_speaking = self.state == TurnState::Speaking;
        self.state = TurnState::Idle;
        was_speaking
    }

    /// Agent audio takes the floor: record the output instant and cancel any
    /// open caller turn. Returns `true` when a turn was cancelled.
    pub fn note_agent_output(&mut self, now: Instant) -> bool {
        self.last_agent_output = Some(now);
        self.agent_has_spoken = true;
        self.exit()
    }

    /// Whether the agent spoke within the cooldown window, i.e. a caller
    /// frame now is a barge-in rather than a fresh turn.
    pub fn agent_holds_floor(&self, now: Instant) -> bool {
        self.agent_has_spoken
            && self
                .last_agent_output
                .is_some_and(|t| now.duration_since(t) <= AGENT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_enters_before_agent_ever_spoke() {
        let t = TurnTracker::new();
        assert!(t.may_enter(Instant::now(), true));
        assert!(t.may_enter(Instant::now(), false));
    }

    #[test]
    fn recent_agent_output_blocks_entry() {
        let mut t = TurnTracker::new();
        let now = Instant::now();
        t.note_agent_output(now);
        assert!(!t.may_enter(now + Duration::from_millis(100), true));
        assert!(t.may_enter(now + Duration::from_millis(501), true));
    }

    #[test]
    fn closed_agent_socket_always_allows_entry() {
        let mut t = TurnTracker::new();
        let now = Instant::now();
        t.note_agent_output(now);
        assert!(t.may_enter(now + Duration::from_millis(100), false));
    }

    #[test]
    fn speaking_blocks_reentry() {
        let mut t = TurnTracker::new();
        t.enter();
        assert!(!t.may_enter(Instant::now(), true));
    }

    #[test]
    fn exit_is_idempotent() {
        let mut t = TurnTracker::new();
        t.enter();
        assert!(t.exit());
        assert!(!t.exit());
    }

    #[test]
    fn agent_audio_cancels_open_turn() {
        let mut t = TurnTracker::new();
        t.enter();
        assert!(t.note_agent_output(Instant::now()));
        assert!(!t.is_speaking());
        // already idle: nothing to cancel
        assert!(!t.note_agent_output(Instant::now()));
    }

    #[test]
    fn floor_tracking() {
        let mut t = TurnTracker::new();
        let now = Instant::now();
        assert!(!t.agent_holds_floor(now));
        t.note_agent_output(now);
        assert!(t.agent_holds_floor(now + Duration::from_millis(400)));
        assert!(!t.agent_holds_floor(now + Duration::from_millis(600)));
    }
}
