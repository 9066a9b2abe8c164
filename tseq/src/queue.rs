//! Queue types for the sequencer

use std::fmt;
use std::time::Duration;

/// Which half of a task a worklist entry is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitRole {
    /// Pure wait that paces the task
    Wait,

    /// Zero-delay unit that invokes the caller's body
    Exec,
}

impl fmt::Display for UnitRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wait => write!(f, "wait"),
            Self::Exec => write!(f, "exec"),
        }
    }
}

/// Statistics for the sequencer, counted per task (exec units)
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SequencerStats {
    pub total_added: u64,
    pub total_completed: u64,
    pub total_skipped: u64,
    pub total_failed: u64,
    pub total_removed: u64,
    pub peak_queue_depth: usize,
}

impl SequencerStats {
    /// Tasks that reached a final outcome
    pub fn total_finished(&self) -> u64 {
        self.total_completed + self.total_skipped + self.total_failed
    }
}

/// Queue state snapshot
#[derive(Debug, Clone)]
pub struct QueueState {
    /// Units waiting in the worklist
    pub queued: usize,

    /// Whether a unit is currently executing
    pub running: bool,

    pub suspended: bool,
    pub stats: SequencerStats,
}

impl QueueState {
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && !self.running
    }
}

/// Queue entry for display
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: String,
    pub role: UnitRole,
    pub status: QueueEntryStatus,
    pub delay: Duration,

    /// Time since submission (queued) or since start (running)
    pub elapsed: Duration,
}

/// Status of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEntryStatus {
    Running,
    Queued,

    /// Still in the worklist but will be skipped
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_finished() {
        let stats = SequencerStats {
            total_added: 5,
            total_completed: 2,
            total_skipped: 1,
            total_failed: 1,
            ..Default::default()
        };
        assert_eq!(stats.total_finished(), 4);
    }

    #[test]
    fn test_queue_state_idle() {
        let idle = QueueState {
            queued: 0,
            running: false,
            suspended: true,
            stats: SequencerStats::default(),
        };
        assert!(idle.is_idle());

        let busy = QueueState { running: true, ..idle };
        assert!(!busy.is_idle());
    }

    #[test]
    fn test_role_display() {
        assert_eq!(UnitRole::Wait.to_string(), "wait");
        assert_eq!(UnitRole::Exec.to_string(), "exec");
    }
}
