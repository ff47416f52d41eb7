#![forbid(unsafe_code)]

// Speaking-slot state machine: one active speaker, a strict-FIFO wait queue,
// and a pending-approval queue for manual-approval mode. Pure state — timers
// and broadcasts live in the coordinator.

use std::collections::VecDeque;

/// Outcome of a speak request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Appended to the wait queue
    Queued,
    /// Already speaking, waiting, or pending — idempotent success
    Unchanged,
    /// Placed into the pending-approval queue
    PendingApproval,
}

/// What a disconnecting user was doing, mic-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    WasSpeaker,
    WasWaiting,
    WasPending,
    NotPresent,
}

/// The shared microphone. Invariants:
/// - a user id appears in the wait queue at most once
/// - the active speaker is never also in the wait queue
/// - a pending entry leaves exactly once, approved or rejected
pub struct MicState {
    speaker: Option<String>,
    queue: VecDeque<String>,
    pending: VecDeque<String>,
    /// Bumped on every grant and release. Expiry timers capture the value at
    /// grant time and no-op if it has moved on by the time they fire.
    grant_seq: u64,
}

impl MicState {
    pub fn new() -> Self {
        Self {
            speaker: None,
            queue: VecDeque::new(),
            pending: VecDeque::new(),
            grant_seq: 0,
        }
    }

    pub fn speaker(&self) -> Option<&str> {
        self.speaker.as_deref()
    }

    pub fn queue(&self) -> impl Iterator<Item = &str> {
        self.queue.iter().map(String::as_str)
    }

    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    pub fn grant_seq(&self) -> u64 {
        self.grant_seq
    }

    pub fn is_waiting(&self, user_id: &str) -> bool {
        self.queue.iter().any(|id| id == user_id)
    }

    pub fn is_pending(&self, user_id: &str) -> bool {
        self.pending.iter().any(|id| id == user_id)
    }

    fn holds(&self, user_id: &str) -> bool {
        self.speaker.as_deref() == Some(user_id) || self.is_waiting(user_id) || self.is_pending(user_id)
    }

    /// Append a user to the wait queue, or to the pending queue when manual
    /// approval is on. Requests from users already tracked are idempotent.
    pub fn request(&mut self, user_id: &str, manual_approval: bool) -> RequestOutcome {
        if self.holds(user_id) {
            return RequestOutcome::Unchanged;
        }
        if manual_approval {
            self.pending.push_back(user_id.to_string());
            RequestOutcome::PendingApproval
        } else {
            self.queue.push_back(user_id.to_string());
            RequestOutcome::Queued
        }
    }

    /// Move a pending entry into the wait queue. False if the user was not
    /// pending (already handled, or never asked).
    pub fn approve(&mut self, user_id: &str) -> bool {
        match self.take_pending(user_id) {
            Some(id) => {
                self.queue.push_back(id);
                true
            }
            None => false,
        }
    }

    /// Discard a pending entry. False if the user was not pending.
    pub fn reject(&mut self, user_id: &str) -> bool {
        self.take_pending(user_id).is_some()
    }

    fn take_pending(&mut self, user_id: &str) -> Option<String> {
        let pos = self.pending.iter().position(|id| id == user_id)?;
        self.pending.remove(pos)
    }

    /// Promote the head of the wait queue to speaker. Only valid while idle;
    /// returns the newly granted user id.
    pub fn promote_next(&mut self) -> Option<String> {
        if self.speaker.is_some() {
            return None;
        }
        let next = self.queue.pop_front()?;
        self.speaker = Some(next.clone());
        self.grant_seq += 1;
        Some(next)
    }

    /// Release the slot if `user_id` is the current speaker. The caller
    /// decides whether to promote the next waiter.
    pub fn release(&mut self, user_id: &str) -> bool {
        if self.speaker.as_deref() != Some(user_id) {
            return false;
        }
        self.speaker = None;
        self.grant_seq += 1;
        true
    }

    /// Remove a user from every mic structure (disconnect path). Never
    /// leaves a dangling reference behind.
    pub fn remove(&mut self, user_id: &str) -> Removal {
        if self.speaker.as_deref() == Some(user_id) {
            self.speaker = None;
            self.grant_seq += 1;
            return Removal::WasSpeaker;
        }
        if let Some(pos) = self.queue.iter().position(|id| id == user_id) {
            self.queue.remove(pos);
            return Removal::WasWaiting;
        }
        if self.take_pending(user_id).is_some() {
            return Removal::WasPending;
        }
        Removal::NotPresent
    }
}

impl Default for MicState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariants(mic: &MicState) {
        let queued: Vec<&str> = mic.queue().collect();
        let mut deduped = queued.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(queued.len(), deduped.len(), "duplicate user in queue");
        if let Some(speaker) = mic.speaker() {
            assert!(!queued.contains(&speaker), "speaker also present in queue");
        }
    }

    #[test]
    fn test_fifo_promotion_through_expiry() {
        let mut mic = MicState::new();
        for id in ["a", "b", "c"] {
            assert_eq!(mic.request(id, false), RequestOutcome::Queued);
        }

        // Idle room: promoting grants the head of the queue
        assert_eq!(mic.promote_next().as_deref(), Some("a"));
        assert_eq!(mic.speaker(), Some("a"));
        assert_eq!(mic.queue().collect::<Vec<_>>(), ["b", "c"]);
        assert_invariants(&mic);

        // Countdown expiry behaves exactly like release
        assert!(mic.release("a"));
        assert_eq!(mic.promote_next().as_deref(), Some("b"));
        assert_eq!(mic.queue().collect::<Vec<_>>(), ["c"]);
        assert_invariants(&mic);
    }

    #[test]
    fn test_duplicate_request_is_idempotent() {
        let mut mic = MicState::new();
        assert_eq!(mic.request("a", false), RequestOutcome::Queued);
        assert_eq!(mic.request("a", false), RequestOutcome::Unchanged);
        assert_eq!(mic.queue().count(), 1);

        mic.promote_next();
        // The active speaker cannot re-enter the queue
        assert_eq!(mic.request("a", false), RequestOutcome::Unchanged);
        assert_eq!(mic.queue().count(), 0);
        assert_invariants(&mic);
    }

    #[test]
    fn test_release_by_non_speaker_is_refused() {
        let mut mic = MicState::new();
        mic.request("a", false);
        mic.promote_next();

        assert!(!mic.release("b"));
        assert_eq!(mic.speaker(), Some("a"));
    }

    #[test]
    fn test_manual_approval_routes_to_pending() {
        let mut mic = MicState::new();
        assert_eq!(mic.request("d", true), RequestOutcome::PendingApproval);
        assert!(mic.is_pending("d"));
        assert!(!mic.is_waiting("d"));

        // Rejection discards the entry for good
        assert!(mic.reject("d"));
        assert!(!mic.is_pending("d"));
        assert!(!mic.reject("d"));
        assert_eq!(mic.promote_next(), None);
    }

    #[test]
    fn test_approval_moves_entry_to_queue_once() {
        let mut mic = MicState::new();
        mic.request("d", true);

        assert!(mic.approve("d"));
        assert!(mic.is_waiting("d"));
        assert!(!mic.is_pending("d"));
        // Entries leave the pending queue exactly once
        assert!(!mic.approve("d"));
        assert_eq!(mic.queue().count(), 1);
        assert_invariants(&mic);
    }

    #[test]
    fn test_remove_clears_every_structure() {
        let mut mic = MicState::new();
        mic.request("a", false);
        mic.promote_next();
        mic.request("b", false);
        mic.request("c", true);

        assert_eq!(mic.remove("a"), Removal::WasSpeaker);
        assert_eq!(mic.remove("b"), Removal::WasWaiting);
        assert_eq!(mic.remove("c"), Removal::WasPending);
        assert_eq!(mic.remove("ghost"), Removal::NotPresent);

        assert_eq!(mic.speaker(), None);
        assert_eq!(mic.queue().count(), 0);
        assert_eq!(mic.pending().count(), 0);
    }

    #[test]
    fn test_grant_seq_moves_on_grant_and_release() {
        let mut mic = MicState::new();
        mic.request("a", false);

        let idle_seq = mic.grant_seq();
        mic.promote_next();
        let granted_seq = mic.grant_seq();
        assert_ne!(idle_seq, granted_seq);

        // A stale timer holding idle_seq must not match after release either
        mic.release("a");
        assert_ne!(mic.grant_seq(), granted_seq);
    }

    #[test]
    fn test_speaker_removal_keeps_queue_intact_for_promotion() {
        let mut mic = MicState::new();
        for id in ["a", "b"] {
            mic.request(id, false);
        }
        mic.promote_next();

        // Disconnecting the speaker leaves the queue ready for promotion
        assert_eq!(mic.remove("a"), Removal::WasSpeaker);
        assert_eq!(mic.promote_next().as_deref(), Some("b"));
        assert_invariants(&mic);
    }
}
