//! Beat-quantized action scheduling
//!
//! A trigger (e.g. "next visual mode") is held until the predicted beat so the
//! change lands on the music, with a deadline so a bad prediction never
//! stalls it for long.

use crate::state::ConsumerAudioState;

/// Below this the tempo is not trusted for scheduling
pub const MIN_TRACKING_BPM: f32 = 1.0;

/// Slack added past the predicted beat before applying anyway
pub const GRACE_MS: u64 = 50;

/// Default cap on how long a trigger may wait for its beat
pub const DEFAULT_MAX_DELAY_MS: u64 = 300;

/// Milliseconds from `now_ms` to the next predicted beat.
///
/// Returns 0 (apply now) when tempo tracking is unusable, the prediction is
/// not in the future, or the wait would exceed `max_delay_ms`.
pub fn ms_to_next_beat(state: &ConsumerAudioState, now_ms: u64, max_delay_ms: u64) -> u64 {
    if state.bpm < MIN_TRACKING_BPM {
        return 0;
    }
    let Some(next) = state.next_beat_ms else {
        return 0;
    };
    if next <= now_ms {
        return 0;
    }

    let delta = next - now_ms;
    if delta > max_delay_ms {
        0
    } else {
        delta
    }
}

/// What happened to a trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch<A> {
    /// Apply the action now
    Now(A),

    /// Held until the next beat or `deadline_ms`
    Deferred { deadline_ms: u64 },

    /// Another action is already waiting
    Ignored,
}

#[derive(Debug, Clone)]
struct PendingAction<A> {
    action: A,
    deadline_ms: u64,
}

/// Holds at most one action until a beat or its deadline
#[derive(Debug, Clone)]
pub struct BeatScheduler<A> {
    pending: Option<PendingAction<A>>,
}

impl<A> Default for BeatScheduler<A> {
    fn default() -> Self {
        Self { pending: None }
    }
}

impl<A> BeatScheduler<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn deadline_ms(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.deadline_ms)
    }

    /// Apply `action` now or hold it for the next beat
    pub fn trigger(
        &mut self,
        action: A,
        state: &ConsumerAudioState,
        now_ms: u64,
        max_delay_ms: u64,
    ) -> Dispatch<A> {
        if self.pending.is_some() {
            return Dispatch::Ignored;
        }

        let delay = ms_to_next_beat(state, now_ms, max_delay_ms);
        if delay == 0 {
            return Dispatch::Now(action);
        }

        let deadline_ms = now_ms + delay + GRACE_MS;
        self.pending = Some(PendingAction {
            action,
            deadline_ms,
        });
        Dispatch::Deferred { deadline_ms }
    }

    /// Call once per frame after merging; returns the held action when it is
    /// due. `state.beat_detected` must only be set for a newly captured beat,
    /// as [`ConsumerAudioState::merge`] does.
    pub fn tick(&mut self, state: &ConsumerAudioState, now_ms: u64) -> Option<A> {
        let due = match &self.pending {
            Some(pending) => state.beat_detected || now_ms >= pending.deadline_ms,
            None => false,
        };
        if due {
            self.pending.take().map(|p| p.action)
        } else {
            None
        }
    }
}
