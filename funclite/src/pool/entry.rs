//! Pool entry status and state machine.

use std::sync::Arc;
use std::time::Instant;

use crate::sandbox::Guest;

/// Lifecycle status of a pooled guest.
///
/// State machine:
/// ```text
/// create() → Idle
/// acquire() → InUse
/// release(healthy) → Idle
/// release(unhealthy) → Corrupted → removed (+ background replacement)
/// ```
/// Guests that fail creation never become entries, so `Creating` has no
/// entry-level representation; in-flight creations are counted by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestStatus {
    /// Warm and waiting for work.
    Idle,
    /// Serving exactly one invocation.
    InUse,
    /// Retired by an unhealthy release; disposal pending.
    Corrupted,
}

impl GuestStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, GuestStatus::Idle)
    }

    pub fn is_in_use(&self) -> bool {
        matches!(self, GuestStatus::InUse)
    }

    pub fn is_healthy(&self) -> bool {
        !matches!(self, GuestStatus::Corrupted)
    }

    /// Check if acquire() can take this entry.
    pub fn can_acquire(&self) -> bool {
        matches!(self, GuestStatus::Idle)
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: GuestStatus) -> bool {
        use GuestStatus::*;
        matches!(
            (self, target),
            (Idle, InUse) | (InUse, Idle) | (InUse, Corrupted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GuestStatus::Idle => "idle",
            GuestStatus::InUse => "in-use",
            GuestStatus::Corrupted => "corrupted",
        }
    }
}

impl std::fmt::Display for GuestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bookkeeping for one pooled guest.
pub struct PoolEntry {
    pub guest: Arc<Guest>,
    pub status: GuestStatus,
    pub last_used: Instant,
}

impl PoolEntry {
    pub fn new(guest: Arc<Guest>) -> Self {
        Self {
            guest,
            status: GuestStatus::Idle,
            last_used: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_idle_entries_can_be_acquired() {
        assert!(GuestStatus::Idle.can_acquire());
        assert!(!GuestStatus::InUse.can_acquire());
        assert!(!GuestStatus::Corrupted.can_acquire());
    }

    #[test]
    fn valid_transitions() {
        assert!(GuestStatus::Idle.can_transition_to(GuestStatus::InUse));
        assert!(GuestStatus::InUse.can_transition_to(GuestStatus::Idle));
        assert!(GuestStatus::InUse.can_transition_to(GuestStatus::Corrupted));
    }

    #[test]
    fn invalid_transitions() {
        assert!(!GuestStatus::Idle.can_transition_to(GuestStatus::Corrupted));
        assert!(!GuestStatus::Corrupted.can_transition_to(GuestStatus::Idle));
        assert!(!GuestStatus::Corrupted.can_transition_to(GuestStatus::InUse));
        assert!(!GuestStatus::Idle.can_transition_to(GuestStatus::Idle));
    }

    #[test]
    fn corrupted_is_unhealthy() {
        assert!(GuestStatus::Idle.is_healthy());
        assert!(GuestStatus::InUse.is_healthy());
        assert!(!GuestStatus::Corrupted.is_healthy());
    }
}
