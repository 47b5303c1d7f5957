/// Whether kernel capacity ran out and we are waiting to be allowed to reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetState {
    Open,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityDecision {
    /// Keep what we have and try again in a later round.
    Wait,
    /// Throw everything away and start over.
    Reset,
}

/// Gates resets of kernel state behind a minimum number of profiling rounds,
/// so persistent pressure does not wipe all unwind information every round.
#[derive(Debug)]
pub struct ResetHysteresis {
    min_rounds: u64,
    rounds_since_reset: u64,
    state: ResetState,
}

impl ResetHysteresis {
    pub fn new(min_rounds: u64) -> Self {
        ResetHysteresis {
            min_rounds,
            rounds_since_reset: 0,
            state: ResetState::Open,
        }
    }

    pub fn state(&self) -> ResetState {
        self.state
    }

    pub fn is_blocked(&self) -> bool {
        self.state == ResetState::Blocked
    }

    pub fn rounds_since_reset(&self) -> u64 {
        self.rounds_since_reset
    }

    pub fn on_round_finished(&mut self) {
        self.rounds_since_reset = self.rounds_since_reset.saturating_add(1);
    }

    pub fn on_capacity_exhausted(&mut self) -> CapacityDecision {
        if self.rounds_since_reset < self.min_rounds {
            self.state = ResetState::Blocked;
            return CapacityDecision::Wait;
        }
        CapacityDecision::Reset
    }

    pub fn on_reset(&mut self) {
        self.rounds_since_reset = 0;
        self.state = ResetState::Open;
    }
}
