//! Controller runtime tests: raw key/surface events in, surface updates and
//! saved items out. Timings are scaled down but keep their ordering margins.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::support::TestVault;
use crate::config::OverlayConfig;
use crate::overlay::{self, ChordKey, InputEvent, SurfaceSink, SurfaceUpdate};

struct CollectingSurface {
    updates: Mutex<Vec<SurfaceUpdate>>,
}

impl CollectingSurface {
    fn new() -> Self {
        Self {
            updates: Mutex::new(Vec::new()),
        }
    }

    fn snapshot(&self) -> Vec<SurfaceUpdate> {
        self.updates.lock().unwrap().clone()
    }
}

impl SurfaceSink for CollectingSurface {
    fn update(&self, update: SurfaceUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

fn test_config() -> OverlayConfig {
    OverlayConfig {
        hold_ms: 40,
        debounce_ms: 5,
        confirm_ms: 30,
    }
}

fn wait_for(mut predicate: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

fn press_chord(handle: &overlay::ControllerHandle) {
    handle.post(InputEvent::KeyDown(ChordKey::Modifier));
    handle.post(InputEvent::KeyDown(ChordKey::Activator));
}

fn release_chord(handle: &overlay::ControllerHandle) {
    handle.post(InputEvent::KeyUp(ChordKey::Activator));
    handle.post(InputEvent::KeyUp(ChordKey::Modifier));
}

#[test]
fn test_text_capture_cycle_ends_in_confirmation_then_hidden() {
    let vault = TestVault::new();
    let engine = vault.engine();
    let surface = Arc::new(CollectingSurface::new());

    let (handle, _thread) = overlay::spawn(engine.clone(), surface.clone(), &test_config());

    press_chord(&handle);
    wait_for(
        || surface
            .snapshot()
            .iter()
            .any(|u| matches!(u, SurfaceUpdate::Show(_))),
        "overlay to show",
    );

    // hold past the threshold, then release: overlay stays latched
    std::thread::sleep(Duration::from_millis(80));
    release_chord(&handle);
    std::thread::sleep(Duration::from_millis(30));
    assert!(!surface.snapshot().contains(&SurfaceUpdate::Hide));

    handle.post(InputEvent::TextSubmit("buy oat milk".to_string()));

    wait_for(
        || surface.snapshot().contains(&SurfaceUpdate::Confirmation),
        "save confirmation",
    );
    wait_for(
        || surface.snapshot().contains(&SurfaceUpdate::Hide),
        "overlay to hide after confirmation",
    );

    let listed = engine.list(None).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].title, "buy oat milk");
}

#[test]
fn test_drag_survives_chord_release_until_drop() {
    let vault = TestVault::new();
    let engine = vault.engine();
    let surface = Arc::new(CollectingSurface::new());

    let (handle, _thread) = overlay::spawn(engine.clone(), surface.clone(), &test_config());

    let png = vault.scratch_file("drag.png", &super::support::tiny_png());

    // chord held, drag starts, chord released without dropping
    press_chord(&handle);
    handle.post(InputEvent::DragEnter);
    release_chord(&handle);

    // past debounce and hold windows: still no hide, the drag pins it
    std::thread::sleep(Duration::from_millis(100));
    assert!(!surface.snapshot().contains(&SurfaceUpdate::Hide));

    handle.post(InputEvent::Drop(vec![png]));

    wait_for(
        || surface.snapshot().contains(&SurfaceUpdate::Confirmation),
        "drop to save",
    );
    wait_for(
        || surface.snapshot().contains(&SurfaceUpdate::Hide),
        "overlay to hide via confirmation",
    );

    // no hide happened before the confirmation
    let updates = surface.snapshot();
    let hide_at = updates
        .iter()
        .position(|u| *u == SurfaceUpdate::Hide)
        .unwrap();
    let confirm_at = updates
        .iter()
        .position(|u| *u == SurfaceUpdate::Confirmation)
        .unwrap();
    assert!(confirm_at < hide_at);

    assert_eq!(engine.list(None).unwrap().len(), 1);
}

#[test]
fn test_tap_then_tap_dismisses() {
    let vault = TestVault::new();
    let engine = vault.engine();
    let surface = Arc::new(CollectingSurface::new());

    let (handle, _thread) = overlay::spawn(engine, surface.clone(), &test_config());

    // quick tap: show and latch
    press_chord(&handle);
    release_chord(&handle);
    wait_for(
        || surface
            .snapshot()
            .iter()
            .any(|u| matches!(u, SurfaceUpdate::Show(_))),
        "overlay to show",
    );
    std::thread::sleep(Duration::from_millis(30));
    assert!(!surface.snapshot().contains(&SurfaceUpdate::Hide));

    // second tap dismisses
    press_chord(&handle);
    release_chord(&handle);
    wait_for(
        || surface.snapshot().contains(&SurfaceUpdate::Hide),
        "overlay to hide",
    );
}

#[test]
fn test_rejected_drop_reports_reason_inline() {
    let vault = TestVault::new();
    let engine = vault.engine();
    let surface = Arc::new(CollectingSurface::new());

    let (handle, _thread) = overlay::spawn(engine.clone(), surface.clone(), &test_config());

    let mp3 = vault.scratch_file("song.mp3", b"not audio");

    press_chord(&handle);
    handle.post(InputEvent::Drop(vec![mp3]));

    wait_for(
        || surface
            .snapshot()
            .iter()
            .any(|u| matches!(u, SurfaceUpdate::Reject(_))),
        "rejection to surface",
    );

    // ingest never ran
    assert_eq!(engine.list(None).unwrap().len(), 0);
    assert_eq!(vault.primary_blob_count(), 0);
}
