use claritylayer::capture::simulated::SimulatedCapture;
use claritylayer::capture::Rect;
use claritylayer::controller::{Controller, ControllerOptions};
use claritylayer::gpu::software::SoftTexture;
use claritylayer::gpu::{Extent, ShaderAssets};
use claritylayer::guard::ManualClock;
use claritylayer::surface::headless::{HeadlessProbe, HeadlessSurface};
use claritylayer::surface::{PresentOutcome, PresentationSurface, SurfaceState};
use claritylayer::transform::{SharedParameters, TransformPipeline};
use claritylayer::StateManager;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn surface() -> (PresentationSurface<HeadlessSurface>, HeadlessProbe, Arc<AtomicUsize>) {
    let backend = HeadlessSurface::new(Rect::new(0, 0, 8, 8));
    let probe = backend.probe();
    let mut surface = PresentationSurface::new(backend, Duration::ZERO);
    surface.initialize().unwrap();

    let recoveries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&recoveries);
    surface.on_device_recovered(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    surface.show().unwrap();
    (surface, probe, recoveries)
}

#[test]
fn device_removal_recovers_exactly_once() {
    let (mut surface, probe, recoveries) = surface();
    let params = Arc::new(SharedParameters::default());
    let mut pipeline = TransformPipeline::new(surface.device_handle(), ShaderAssets::builtin(), params);
    pipeline.initialize().unwrap();
    surface.on_device_recovered(pipeline.recovery_listener());

    let frame = SoftTexture::filled(Extent::new(8, 8), [0.3, 0.3, 0.3, 1.0]);
    let output = pipeline.process(&frame).unwrap();
    surface.render_frame(output).unwrap();
    probe.remove_device_on_next_present();
    assert_eq!(surface.present(), PresentOutcome::Recovered);
    assert_eq!(recoveries.load(Ordering::SeqCst), 1);
    assert!(pipeline.is_stale());

    for _ in 0..3 {
        let output = pipeline.process(&frame).unwrap();
        surface.render_frame(output).unwrap();
        assert_eq!(surface.present(), PresentOutcome::Presented);
    }
    assert_eq!(recoveries.load(Ordering::SeqCst), 1);
    assert_eq!(surface.state(), SurfaceState::Ready);
    assert_eq!(probe.device_creations(), 2);
    assert!(probe.release_count() >= 1);
}

#[test]
fn failed_recovery_leaves_surface_hidden() {
    let (mut surface, probe, recoveries) = surface();
    probe.fail_device_creation(true);
    probe.remove_device_on_next_present();

    assert_eq!(surface.present(), PresentOutcome::RecoveryFailed);
    assert_eq!(surface.state(), SurfaceState::Failed);
    assert!(!surface.is_visible());
    assert!(!probe.is_window_visible());
    assert_eq!(recoveries.load(Ordering::SeqCst), 0);
    assert!(surface.device_handle().current().is_none());
    assert!(surface.show().is_err());
}

#[test]
fn resize_failure_hides_surface() {
    let (mut surface, probe, _recoveries) = surface();
    probe.fail_resize(true);
    probe.set_desktop(Rect::new(0, 0, 2560, 1440));

    assert!(surface.on_display_change().is_err());
    assert!(!surface.is_visible());
    assert!(!probe.is_window_visible());
}

#[test]
fn controller_reattaches_capture_after_recovery() {
    let capture = SimulatedCapture::with_monitors(2);
    let backend = HeadlessSurface::new(Rect::new(0, 0, 4, 4));
    let probe = backend.probe();
    let options = ControllerOptions {
        settle: Duration::ZERO,
        ..ControllerOptions::default()
    };
    let controller = Controller::new(capture.clone(), backend, options).unwrap();
    controller.enable(true).unwrap();
    assert_eq!(capture.open_count(), 2);

    let frame = SoftTexture::filled(Extent::new(4, 4), [0.5; 4]);
    probe.reset_device_on_next_present();
    capture.emit(1, Some(&frame));
    assert_eq!(controller.surface_state(), SurfaceState::Ready);

    controller.pump_events();
    assert_eq!(capture.open_count(), 4);
    assert_eq!(controller.session_count(), 2);

    capture.emit(1, Some(&frame));
    assert_eq!(probe.present_count(), 1);
}

#[test]
fn failed_recovery_switches_effects_off_without_panicking() {
    let dir = std::env::temp_dir().join(format!("claritylayer_recovery_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let state = Arc::new(StateManager::open(&dir).unwrap());

    let capture = SimulatedCapture::with_monitors(1);
    let backend = HeadlessSurface::new(Rect::new(0, 0, 4, 4));
    let probe = backend.probe();
    let clock = Arc::new(ManualClock::new());
    let period = Duration::from_millis(100);
    let options = ControllerOptions {
        settle: Duration::ZERO,
        watchdog_period: period,
        clock: clock.clone(),
        ..ControllerOptions::default()
    };
    let controller = Controller::new(capture.clone(), backend, options)
        .unwrap()
        .with_state(Arc::clone(&state));
    controller.enable(true).unwrap();
    assert!(state.read(|s| s.enhancement_enabled));

    probe.fail_device_creation(true);
    probe.remove_device_on_next_present();
    let frame = SoftTexture::filled(Extent::new(4, 4), [0.5; 4]);
    capture.emit(1, Some(&frame));

    assert_eq!(controller.surface_state(), SurfaceState::Failed);
    assert!(!controller.is_enabled());
    assert_eq!(controller.session_count(), 0);
    assert!(!probe.is_window_visible());
    assert!(!controller.guard().is_armed());

    controller.pump_events();
    assert!(!state.read(|s| s.enhancement_enabled));

    for _ in 0..3 {
        clock.advance(period);
        assert!(!controller.guard().check());
    }
    assert!(!controller.is_in_safe_mode());
    assert_eq!(controller.guard().panic_count(), 0);

    drop(controller);
    drop(state);
    let _ = std::fs::remove_dir_all(&dir);
}
