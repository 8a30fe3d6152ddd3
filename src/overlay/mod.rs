//! Overlay controller: global chord -> transient capture surface -> ingest.
//!
//! Three collaborators feed one event queue: the OS keyboard hook posts raw
//! key events and returns immediately, the capture surface posts drag/drop
//! and text events, and ingest workers post save completions. A single
//! controller thread drains the queue, drives the chord tracker and the
//! state machine, and executes their effects.
//!
//! The controller consumes only the engine's ingest entry points; it never
//! touches the stores or the semantic index directly.

pub mod chord;
pub mod state;
pub mod validate;

pub use chord::{ChordEdge, ChordKey, ChordTracker};
pub use state::{
    CapturePayload, Effect, OverlayEvent, OverlayMachine, OverlayMode, OverlayState,
};

use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use crate::config::OverlayConfig;
use crate::engine::Engine;

/// Raw events posted into the controller queue.
#[derive(Debug, Clone)]
pub enum InputEvent {
    KeyDown(ChordKey),
    KeyUp(ChordKey),

    DragEnter,
    DragLeave,
    Drop(Vec<PathBuf>),
    TextSubmit(String),
    Paste(String),
    Cancel,
    DismissError,

    Saved,
    SaveFailed(String),
}

/// Rendering instructions for the capture surface (the UI collaborator).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SurfaceUpdate {
    Show(OverlayMode),
    Hide,
    Confirmation,
    Error(String),
    Reject(String),
}

/// The surface the controller draws on. Implementations must not block.
pub trait SurfaceSink: Send + Sync {
    fn update(&self, update: SurfaceUpdate);
}

/// Cheap cloneable handle for the hook and the surface to post events.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<InputEvent>,
}

impl ControllerHandle {
    pub fn post(&self, event: InputEvent) {
        if let Err(err) = self.tx.send(event) {
            log::error!("overlay controller is gone: {err}");
        }
    }
}

pub struct OverlayController {
    machine: OverlayMachine,
    chord: ChordTracker,

    hold: Duration,
    confirm: Duration,
    hold_deadline: Option<Instant>,
    confirm_deadline: Option<Instant>,

    engine: Arc<Engine>,
    surface: Arc<dyn SurfaceSink>,
    tx: mpsc::Sender<InputEvent>,
}

/// Start the controller on its own thread. Returns the posting handle.
pub fn spawn(
    engine: Arc<Engine>,
    surface: Arc<dyn SurfaceSink>,
    config: &OverlayConfig,
) -> (ControllerHandle, std::thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();

    let mut controller = OverlayController {
        machine: OverlayMachine::new(),
        chord: ChordTracker::new(Duration::from_millis(config.debounce_ms)),
        hold: Duration::from_millis(config.hold_ms),
        confirm: Duration::from_millis(config.confirm_ms),
        hold_deadline: None,
        confirm_deadline: None,
        engine,
        surface,
        tx: tx.clone(),
    };

    let handle = std::thread::spawn(move || controller.run(rx));

    (ControllerHandle { tx }, handle)
}

impl OverlayController {
    fn run(&mut self, rx: mpsc::Receiver<InputEvent>) {
        loop {
            let now = Instant::now();

            let event = match self.next_deadline() {
                Some(deadline) => {
                    match rx.recv_timeout(deadline.saturating_duration_since(now)) {
                        Ok(event) => Some(event),
                        Err(mpsc::RecvTimeoutError::Timeout) => None,
                        Err(mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                }
                None => match rx.recv() {
                    Ok(event) => Some(event),
                    Err(_) => return,
                },
            };

            let now = Instant::now();
            self.fire_expired_timers(now);

            if let Some(event) = event {
                self.dispatch(event, now);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.hold_deadline,
            self.confirm_deadline,
            self.chord.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn fire_expired_timers(&mut self, now: Instant) {
        if let Some(edge) = self.chord.tick(now) {
            self.feed(edge_event(edge), now);
        }

        if self.hold_deadline.is_some_and(|d| now >= d) {
            self.hold_deadline = None;
            self.feed(OverlayEvent::HoldElapsed, now);
        }

        if self.confirm_deadline.is_some_and(|d| now >= d) {
            self.confirm_deadline = None;
            self.feed(OverlayEvent::ConfirmElapsed, now);
        }
    }

    fn dispatch(&mut self, event: InputEvent, now: Instant) {
        match event {
            InputEvent::KeyDown(key) => {
                if let Some(edge) = self.chord.key_down(key, now) {
                    self.feed(edge_event(edge), now);
                }
            }
            InputEvent::KeyUp(key) => {
                // the release only commits after the debounce window; the
                // run loop wakes on chord.next_deadline()
                self.chord.key_up(key, now);
            }
            InputEvent::DragEnter => self.feed(OverlayEvent::DragEnter, now),
            InputEvent::DragLeave => self.feed(OverlayEvent::DragLeave, now),
            InputEvent::Drop(paths) => self.feed(OverlayEvent::Drop(paths), now),
            InputEvent::TextSubmit(text) => self.feed(OverlayEvent::TextSubmit(text), now),
            InputEvent::Paste(text) => self.feed(OverlayEvent::Paste(text), now),
            InputEvent::Cancel => self.feed(OverlayEvent::Cancel, now),
            InputEvent::DismissError => self.feed(OverlayEvent::DismissError, now),
            InputEvent::Saved => self.feed(OverlayEvent::Saved, now),
            InputEvent::SaveFailed(reason) => self.feed(OverlayEvent::SaveFailed(reason), now),
        }
    }

    fn feed(&mut self, event: OverlayEvent, now: Instant) {
        let effects = self.machine.handle(event);
        self.apply(effects, now);
    }

    fn apply(&mut self, effects: Vec<Effect>, now: Instant) {
        for effect in effects {
            match effect {
                Effect::ShowOverlay(mode) => self.surface.update(SurfaceUpdate::Show(mode)),
                Effect::HideOverlay => self.surface.update(SurfaceUpdate::Hide),
                Effect::ShowConfirmation => self.surface.update(SurfaceUpdate::Confirmation),
                Effect::ShowError(reason) => self.surface.update(SurfaceUpdate::Error(reason)),
                Effect::RejectPayload(reason) => self.surface.update(SurfaceUpdate::Reject(reason)),

                Effect::ArmHoldTimer => self.hold_deadline = Some(now + self.hold),
                Effect::CancelHoldTimer => self.hold_deadline = None,
                Effect::ArmConfirmTimer => self.confirm_deadline = Some(now + self.confirm),

                Effect::BeginIngest(payload) => self.begin_ingest(payload),
            }
        }
    }

    /// Ingest off the controller thread; the outcome comes back through the
    /// queue as `Saved` / `SaveFailed`.
    fn begin_ingest(&self, payload: CapturePayload) {
        let engine = self.engine.clone();
        let tx = self.tx.clone();

        std::thread::spawn(move || {
            let outcome = run_ingest(&engine, payload);
            let event = match outcome {
                Ok(()) => InputEvent::Saved,
                Err(reason) => InputEvent::SaveFailed(reason),
            };
            if let Err(err) = tx.send(event) {
                log::error!("failed to report save outcome: {err}");
            }
        });
    }
}

fn run_ingest(engine: &Engine, payload: CapturePayload) -> Result<(), String> {
    match payload {
        CapturePayload::Text { text, .. } => engine
            .ingest_text(&text)
            .map(|_| ())
            .map_err(|e| e.reason()),
        CapturePayload::Link { url } => engine
            .ingest_link(&url, None)
            .map(|_| ())
            .map_err(|e| e.reason()),
        CapturePayload::Files(paths) => {
            for path in &paths {
                engine
                    .ingest_file(path)
                    .map(|_| ())
                    .map_err(|e| e.reason())?;
            }
            Ok(())
        }
    }
}

fn edge_event(edge: ChordEdge) -> OverlayEvent {
    match edge {
        ChordEdge::Activated => OverlayEvent::ChordActivated,
        ChordEdge::Deactivated => OverlayEvent::ChordDeactivated,
    }
}
