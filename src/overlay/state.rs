//! The overlay state machine.
//!
//! One value owns the whole interaction state: visibility, the tap/hold
//! distinction, drag persistence, and the save lifecycle. Handlers feed it
//! events and receive effects; nothing here touches the engine, timers, or
//! the surface directly, which keeps every transition unit-testable.
//!
//! ```text
//! hidden <-(tap)-> latched        pressing: the tap/hold decision window
//!    \               |
//!     \-> pressing --+--(hold elapses)--> latched
//!                 any -(valid payload)-> saving -> confirmation -> hidden
//!                                          \-(failure)-> error  -> hidden
//! ```

use std::path::PathBuf;

use crate::items::Category;
use crate::overlay::validate;

/// Overlay interaction states. While `Saving` or `Confirmation` is in
/// effect, chord transitions are ignored: a save always completes visibly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayState {
    Hidden,
    /// Chord is down and the hold timer is running; a quick release toggles,
    /// a sustained hold latches.
    Pressing {
        came_from_latched: bool,
    },
    /// Visible independent of the chord until an explicit press/release
    /// cycle dismisses it.
    Latched,
    Saving,
    Confirmation,
    Error,
}

/// What the surface opens into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayMode {
    Text,
    Drop,
}

/// A validated capture on its way to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapturePayload {
    Text { text: String },
    Link { url: String },
    Files(Vec<PathBuf>),
}

/// Events the machine consumes: chord edges from the tracker, surface
/// events from the UI collaborator, timer expiries, and save completions.
#[derive(Debug, Clone)]
pub enum OverlayEvent {
    ChordActivated,
    ChordDeactivated,
    HoldElapsed,
    ConfirmElapsed,

    DragEnter,
    DragLeave,
    Drop(Vec<PathBuf>),
    TextSubmit(String),
    Paste(String),
    Cancel,

    Saved,
    SaveFailed(String),
    DismissError,
}

/// Side effects for the runtime to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    ShowOverlay(OverlayMode),
    HideOverlay,
    ArmHoldTimer,
    CancelHoldTimer,
    ArmConfirmTimer,
    BeginIngest(CapturePayload),
    /// Validation failed; show the reason inline, stay put
    RejectPayload(String),
    ShowConfirmation,
    ShowError(String),
}

pub struct OverlayMachine {
    state: OverlayState,
    /// Nested drag_enter depth; the overlay never hides while > 0
    drag_depth: u32,
    /// Last dismissal was an error; the next open lands in text mode
    reopen_in_text: bool,
}

impl Default for OverlayMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayMachine {
    pub fn new() -> Self {
        Self {
            state: OverlayState::Hidden,
            drag_depth: 0,
            reopen_in_text: false,
        }
    }

    pub fn state(&self) -> OverlayState {
        self.state
    }

    pub fn drag_active(&self) -> bool {
        self.drag_depth > 0
    }

    pub fn handle(&mut self, event: OverlayEvent) -> Vec<Effect> {
        match event {
            OverlayEvent::ChordActivated => self.on_chord_active(),
            OverlayEvent::ChordDeactivated => self.on_chord_inactive(),
            OverlayEvent::HoldElapsed => self.on_hold_elapsed(),
            OverlayEvent::ConfirmElapsed => self.on_confirm_elapsed(),
            OverlayEvent::DragEnter => {
                self.drag_depth += 1;
                vec![]
            }
            OverlayEvent::DragLeave => {
                self.drag_depth = self.drag_depth.saturating_sub(1);
                vec![]
            }
            OverlayEvent::Drop(paths) => {
                self.drag_depth = 0;
                self.on_payload(validate_drop(paths))
            }
            OverlayEvent::TextSubmit(text) | OverlayEvent::Paste(text) => {
                self.on_payload(validate_text(&text))
            }
            OverlayEvent::Cancel => self.on_cancel(),
            OverlayEvent::Saved => self.on_saved(),
            OverlayEvent::SaveFailed(reason) => self.on_save_failed(reason),
            OverlayEvent::DismissError => self.on_dismiss_error(),
        }
    }

    fn on_chord_active(&mut self) -> Vec<Effect> {
        match self.state {
            // save must complete visibly; the user dismisses errors explicitly
            OverlayState::Saving | OverlayState::Confirmation | OverlayState::Error => vec![],

            OverlayState::Hidden => {
                // context-aware open: a drag already in progress skips the
                // tap/hold window and lands straight in drop mode
                if self.drag_active() && !self.reopen_in_text {
                    self.state = OverlayState::Latched;
                    return vec![Effect::ShowOverlay(OverlayMode::Drop)];
                }

                self.reopen_in_text = false;
                self.state = OverlayState::Pressing {
                    came_from_latched: false,
                };
                vec![Effect::ShowOverlay(OverlayMode::Text), Effect::ArmHoldTimer]
            }

            OverlayState::Latched => {
                self.state = OverlayState::Pressing {
                    came_from_latched: true,
                };
                // already visible
                vec![Effect::ArmHoldTimer]
            }

            OverlayState::Pressing { .. } => vec![],
        }
    }

    fn on_chord_inactive(&mut self) -> Vec<Effect> {
        match self.state {
            OverlayState::Pressing { came_from_latched } => {
                if came_from_latched {
                    // explicit press/release cycle dismisses
                    self.hide_or_stay(vec![Effect::CancelHoldTimer])
                } else {
                    // quick tap from hidden leaves the overlay latched on
                    self.state = OverlayState::Latched;
                    vec![Effect::CancelHoldTimer]
                }
            }
            // latched survives chord release; everything else ignores it
            _ => vec![],
        }
    }

    fn on_hold_elapsed(&mut self) -> Vec<Effect> {
        if let OverlayState::Pressing { .. } = self.state {
            // a sustained hold keeps the overlay on release
            self.state = OverlayState::Latched;
        }
        vec![]
    }

    fn on_confirm_elapsed(&mut self) -> Vec<Effect> {
        if self.state == OverlayState::Confirmation {
            return self.hide_or_stay(vec![]);
        }
        vec![]
    }

    fn on_payload(&mut self, validated: Result<CapturePayload, String>) -> Vec<Effect> {
        // while a save is in flight the surface is locked
        if matches!(
            self.state,
            OverlayState::Saving | OverlayState::Confirmation
        ) {
            return vec![];
        }

        match validated {
            Ok(payload) => {
                let was_hidden = self.state == OverlayState::Hidden;
                self.state = OverlayState::Saving;

                let mut effects = Vec::with_capacity(3);
                if was_hidden {
                    effects.push(Effect::ShowOverlay(OverlayMode::Text));
                }
                effects.push(Effect::CancelHoldTimer);
                effects.push(Effect::BeginIngest(payload));
                effects
            }
            Err(reason) => vec![Effect::RejectPayload(reason)],
        }
    }

    fn on_cancel(&mut self) -> Vec<Effect> {
        match self.state {
            OverlayState::Saving | OverlayState::Confirmation => vec![],
            OverlayState::Hidden => vec![],
            OverlayState::Error => self.on_dismiss_error(),
            _ => self.hide_or_stay(vec![Effect::CancelHoldTimer]),
        }
    }

    fn on_saved(&mut self) -> Vec<Effect> {
        if self.state != OverlayState::Saving {
            return vec![];
        }
        self.state = OverlayState::Confirmation;
        vec![Effect::ShowConfirmation, Effect::ArmConfirmTimer]
    }

    fn on_save_failed(&mut self, reason: String) -> Vec<Effect> {
        if self.state != OverlayState::Saving {
            return vec![];
        }
        self.state = OverlayState::Error;
        vec![Effect::ShowError(reason)]
    }

    fn on_dismiss_error(&mut self) -> Vec<Effect> {
        if self.state != OverlayState::Error {
            return vec![];
        }
        // reopen-on-failure: the next chord press lands back in text mode
        self.reopen_in_text = true;
        self.hide_or_stay(vec![])
    }

    /// Hide unless a drag is in progress; a dragged-over overlay never hides.
    fn hide_or_stay(&mut self, mut effects: Vec<Effect>) -> Vec<Effect> {
        if self.drag_active() {
            self.state = OverlayState::Latched;
        } else {
            self.state = OverlayState::Hidden;
            effects.push(Effect::HideOverlay);
        }
        effects
    }
}

fn validate_text(text: &str) -> Result<CapturePayload, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("nothing to save".to_string());
    }

    // the controller only decides link vs text here; the engine derives the
    // final category from the same heuristics
    if validate::classify_text(trimmed) == Category::Links {
        return Ok(CapturePayload::Link {
            url: trimmed.to_string(),
        });
    }

    Ok(CapturePayload::Text {
        text: trimmed.to_string(),
    })
}

fn validate_drop(paths: Vec<PathBuf>) -> Result<CapturePayload, String> {
    if paths.is_empty() {
        return Err("nothing was dropped".to_string());
    }

    for path in &paths {
        validate::classify_path(path)?;
    }

    Ok(CapturePayload::Files(paths))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> OverlayMachine {
        OverlayMachine::new()
    }

    #[test]
    fn test_tap_from_hidden_latches() {
        let mut m = machine();

        let effects = m.handle(OverlayEvent::ChordActivated);
        assert!(effects.contains(&Effect::ShowOverlay(OverlayMode::Text)));
        assert!(effects.contains(&Effect::ArmHoldTimer));

        // quick release before the hold threshold
        let effects = m.handle(OverlayEvent::ChordDeactivated);
        assert_eq!(effects, vec![Effect::CancelHoldTimer]);
        assert_eq!(m.state(), OverlayState::Latched);
    }

    #[test]
    fn test_tap_from_latched_hides() {
        let mut m = machine();
        m.handle(OverlayEvent::ChordActivated);
        m.handle(OverlayEvent::ChordDeactivated); // latched

        m.handle(OverlayEvent::ChordActivated);
        let effects = m.handle(OverlayEvent::ChordDeactivated);
        assert!(effects.contains(&Effect::HideOverlay));
        assert_eq!(m.state(), OverlayState::Hidden);
    }

    #[test]
    fn test_hold_past_threshold_stays_latched_on_release() {
        let mut m = machine();
        m.handle(OverlayEvent::ChordActivated);
        m.handle(OverlayEvent::HoldElapsed);
        assert_eq!(m.state(), OverlayState::Latched);

        // release after a long hold: overlay stays
        let effects = m.handle(OverlayEvent::ChordDeactivated);
        assert!(effects.is_empty());
        assert_eq!(m.state(), OverlayState::Latched);

        // an explicit press/release cycle then dismisses
        m.handle(OverlayEvent::ChordActivated);
        m.handle(OverlayEvent::ChordDeactivated);
        assert_eq!(m.state(), OverlayState::Hidden);
    }

    #[test]
    fn test_drag_keeps_overlay_visible_through_chord_release() {
        let mut m = machine();
        m.handle(OverlayEvent::ChordActivated);
        m.handle(OverlayEvent::HoldElapsed); // latched
        m.handle(OverlayEvent::DragEnter);

        // press/release cycle would normally hide; drag pins it
        m.handle(OverlayEvent::ChordActivated);
        let effects = m.handle(OverlayEvent::ChordDeactivated);
        assert!(!effects.contains(&Effect::HideOverlay));
        assert_eq!(m.state(), OverlayState::Latched);
    }

    #[test]
    fn test_nested_drag_needs_matching_leaves() {
        let mut m = machine();
        m.handle(OverlayEvent::DragEnter);
        m.handle(OverlayEvent::DragEnter);
        m.handle(OverlayEvent::DragLeave);
        assert!(m.drag_active());
        m.handle(OverlayEvent::DragLeave);
        assert!(!m.drag_active());
    }

    #[test]
    fn test_context_aware_open_lands_in_drop_mode() {
        let mut m = machine();
        m.handle(OverlayEvent::DragEnter);

        let effects = m.handle(OverlayEvent::ChordActivated);
        assert_eq!(effects, vec![Effect::ShowOverlay(OverlayMode::Drop)]);
        assert_eq!(m.state(), OverlayState::Latched);
    }

    #[test]
    fn test_drop_then_save_then_confirmation_then_hidden() {
        let mut m = machine();
        m.handle(OverlayEvent::ChordActivated);
        m.handle(OverlayEvent::HoldElapsed);

        m.handle(OverlayEvent::DragEnter);
        let effects = m.handle(OverlayEvent::Drop(vec![PathBuf::from("photo.png")]));
        assert!(matches!(
            effects.last(),
            Some(Effect::BeginIngest(CapturePayload::Files(_)))
        ));
        assert_eq!(m.state(), OverlayState::Saving);

        // chord noise during save is ignored
        assert!(m.handle(OverlayEvent::ChordActivated).is_empty());
        assert!(m.handle(OverlayEvent::ChordDeactivated).is_empty());

        let effects = m.handle(OverlayEvent::Saved);
        assert!(effects.contains(&Effect::ShowConfirmation));
        assert_eq!(m.state(), OverlayState::Confirmation);

        let effects = m.handle(OverlayEvent::ConfirmElapsed);
        assert!(effects.contains(&Effect::HideOverlay));
        assert_eq!(m.state(), OverlayState::Hidden);
    }

    #[test]
    fn test_rejected_drop_has_no_side_effects() {
        let mut m = machine();
        m.handle(OverlayEvent::ChordActivated);

        let effects = m.handle(OverlayEvent::Drop(vec![PathBuf::from("song.mp3")]));
        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0], Effect::RejectPayload(_)));
        // still where we were, no ingest
        assert!(matches!(m.state(), OverlayState::Pressing { .. }));
    }

    #[test]
    fn test_save_failure_waits_for_dismissal_then_reopens_in_text() {
        let mut m = machine();
        m.handle(OverlayEvent::ChordActivated);
        m.handle(OverlayEvent::TextSubmit("remember the milk".to_string()));
        assert_eq!(m.state(), OverlayState::Saving);

        let effects = m.handle(OverlayEvent::SaveFailed("disk full".to_string()));
        assert_eq!(
            effects,
            vec![Effect::ShowError("disk full".to_string())]
        );

        // chord is ignored until the user dismisses
        assert!(m.handle(OverlayEvent::ChordActivated).is_empty());

        let effects = m.handle(OverlayEvent::DismissError);
        assert!(effects.contains(&Effect::HideOverlay));

        // reopen-on-failure: next open is in text mode even mid-drag
        m.handle(OverlayEvent::DragEnter);
        let effects = m.handle(OverlayEvent::ChordActivated);
        assert!(effects.contains(&Effect::ShowOverlay(OverlayMode::Text)));
    }

    #[test]
    fn test_pasted_url_becomes_link_payload() {
        let mut m = machine();
        m.handle(OverlayEvent::ChordActivated);

        let effects = m.handle(OverlayEvent::Paste("https://example.com/docs".to_string()));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::BeginIngest(CapturePayload::Link { url }) if url == "https://example.com/docs"
        )));
    }

    #[test]
    fn test_empty_text_is_rejected() {
        let mut m = machine();
        m.handle(OverlayEvent::ChordActivated);

        let effects = m.handle(OverlayEvent::TextSubmit("   ".to_string()));
        assert!(matches!(effects[0], Effect::RejectPayload(_)));
    }

    #[test]
    fn test_confirmation_with_drag_in_progress_stays_visible() {
        let mut m = machine();
        m.handle(OverlayEvent::ChordActivated);
        m.handle(OverlayEvent::TextSubmit("note one".to_string()));
        m.handle(OverlayEvent::Saved);

        m.handle(OverlayEvent::DragEnter);
        let effects = m.handle(OverlayEvent::ConfirmElapsed);
        assert!(!effects.contains(&Effect::HideOverlay));
        assert_eq!(m.state(), OverlayState::Latched);
    }
}
