//! Process liveness label, served as plain text at `/state`.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    StartingUp = 0,
    Reindexing = 1,
    ReindexingDone = 2,
    StartedUp = 3,
    StreamingWal = 4,
    ShuttingDown = 5,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::StartingUp => "starting-up",
            Phase::Reindexing => "reindexing",
            Phase::ReindexingDone => "reindexing: done",
            Phase::StartedUp => "started up",
            Phase::StreamingWal => "streaming wal",
            Phase::ShuttingDown => "shutting down",
        }
    }

    fn from_u8(v: u8) -> Phase {
        match v {
            1 => Phase::Reindexing,
            2 => Phase::ReindexingDone,
            3 => Phase::StartedUp,
            4 => Phase::StreamingWal,
            5 => Phase::ShuttingDown,
            _ => Phase::StartingUp,
        }
    }
}

/// Lock-free state cell shared between the startup sequence and the HTTP
/// endpoint.
#[derive(Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(Phase::StartingUp as u8))
    }

    pub fn store(&self, phase: Phase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    pub fn load(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.load(), Phase::StartingUp);
        assert_eq!(cell.load().as_str(), "starting-up");

        cell.store(Phase::Reindexing);
        assert_eq!(cell.load().as_str(), "reindexing");
        cell.store(Phase::ReindexingDone);
        assert_eq!(cell.load().as_str(), "reindexing: done");
        cell.store(Phase::StreamingWal);
        assert_eq!(cell.load().as_str(), "streaming wal");
        cell.store(Phase::ShuttingDown);
        assert_eq!(cell.load().as_str(), "shutting down");
    }
}
