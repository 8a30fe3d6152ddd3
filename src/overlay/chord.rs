//! Chord tracking with key-repeat filtering and release debouncing.
//!
//! The OS hook reports raw key-down/key-up events for the two chord keys.
//! OS key repeat produces spurious key-downs while a key is held (filtered:
//! a down for a key already down is ignored), and bouncy switches produce
//! spurious up/down pairs (debounced: a key-up only commits after ~50 ms
//! with no matching key-down).
//!
//! The tracker is pure over an injected clock: `key_up` hands back the
//! deadline at which the release commits, the runtime arms a timer and calls
//! `tick` when it fires.

use std::time::{Duration, Instant};

/// The two physical keys forming the activation chord (Alt + D on every
/// platform we hook; identities are mapped by the hook adapter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChordKey {
    Modifier,
    Activator,
}

/// Edge reported when the chord's active state flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChordEdge {
    Activated,
    Deactivated,
}

#[derive(Debug, Clone, Copy, Default)]
struct KeyState {
    down: bool,
    /// Deadline of a debounced, not-yet-committed release
    pending_release: Option<Instant>,
}

pub struct ChordTracker {
    debounce: Duration,
    modifier: KeyState,
    activator: KeyState,
}

impl ChordTracker {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            modifier: KeyState::default(),
            activator: KeyState::default(),
        }
    }

    /// Both keys physically down (a pending release still counts as down).
    pub fn is_active(&self) -> bool {
        self.modifier.down && self.activator.down
    }

    pub fn key_down(&mut self, key: ChordKey, _now: Instant) -> Option<ChordEdge> {
        let was_active = self.is_active();
        let state = self.key_mut(key);

        if state.down {
            // key repeat, or a bounce arriving inside the debounce window:
            // annul the pending release and keep the key down
            state.pending_release = None;
            return None;
        }

        state.down = true;
        (!was_active && self.is_active()).then_some(ChordEdge::Activated)
    }

    /// Record a key-up. The release only commits after the debounce window;
    /// the returned deadline tells the runtime when to call `tick`.
    pub fn key_up(&mut self, key: ChordKey, now: Instant) -> Option<Instant> {
        let debounce = self.debounce;
        let state = self.key_mut(key);

        if !state.down || state.pending_release.is_some() {
            return None;
        }

        let deadline = now + debounce;
        state.pending_release = Some(deadline);
        Some(deadline)
    }

    /// Commit any pending releases whose window has passed.
    pub fn tick(&mut self, now: Instant) -> Option<ChordEdge> {
        let was_active = self.is_active();

        for key in [ChordKey::Modifier, ChordKey::Activator] {
            let state = self.key_mut(key);
            if let Some(deadline) = state.pending_release {
                if now >= deadline {
                    state.down = false;
                    state.pending_release = None;
                }
            }
        }

        (was_active && !self.is_active()).then_some(ChordEdge::Deactivated)
    }

    /// Earliest pending deadline, for the runtime's timer arithmetic.
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.modifier.pending_release, self.activator.pending_release]
            .into_iter()
            .flatten()
            .min()
    }

    fn key_mut(&mut self, key: ChordKey) -> &mut KeyState {
        match key {
            ChordKey::Modifier => &mut self.modifier,
            ChordKey::Activator => &mut self.activator,
        }
    }
}
