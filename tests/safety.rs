use claritylayer::capture::simulated::SimulatedCapture;
use claritylayer::capture::Rect;
use claritylayer::controller::{Controller, ControllerOptions};
use claritylayer::error::ControlError;
use claritylayer::gpu::software::SoftTexture;
use claritylayer::gpu::Extent;
use claritylayer::guard::{AudioChannel, AudioFeedback, ManualClock, PanicReason};
use claritylayer::surface::headless::{HeadlessProbe, HeadlessSurface};
use claritylayer::surface::SurfaceState;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PERIOD: Duration = Duration::from_millis(100);

struct Beeps(Arc<AtomicUsize>);

impl AudioChannel for Beeps {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn alert(&self) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    controller: Controller<SimulatedCapture, HeadlessSurface>,
    capture: SimulatedCapture,
    probe: HeadlessProbe,
    clock: Arc<ManualClock>,
    beeps: Arc<AtomicUsize>,
}

fn harness() -> Harness {
    let capture = SimulatedCapture::with_monitors(2);
    let surface = HeadlessSurface::new(Rect::new(0, 0, 8, 8));
    let probe = surface.probe();
    let clock = Arc::new(ManualClock::new());
    let beeps = Arc::new(AtomicUsize::new(0));
    let audio = AudioFeedback::new(
        vec![Box::new(Beeps(Arc::clone(&beeps))), Box::new(Beeps(Arc::clone(&beeps)))],
        None,
        false,
    );
    let options = ControllerOptions {
        settle: Duration::ZERO,
        watchdog_period: PERIOD,
        clock: clock.clone(),
        audio,
        ..ControllerOptions::default()
    };
    let controller = Controller::new(capture.clone(), surface, options).unwrap();
    Harness {
        controller,
        capture,
        probe,
        clock,
        beeps,
    }
}

fn frame() -> SoftTexture {
    SoftTexture::filled(Extent::new(8, 8), [0.5, 0.5, 0.5, 1.0])
}

fn assert_fully_off(h: &Harness) {
    assert!(!h.controller.is_enabled());
    assert!(h.controller.is_in_safe_mode());
    assert_eq!(h.controller.session_count(), 0);
    assert!(!h.probe.is_window_visible());
    assert!(!h.controller.guard().is_armed());
}

#[test]
fn stale_heartbeat_panics_exactly_once() {
    let h = harness();
    h.controller.enable(true).unwrap();

    h.clock.advance(PERIOD);
    h.capture.emit(1, Some(&frame()));
    assert!(!h.controller.guard().check());

    // Frames stop arriving
    for _ in 0..2 {
        h.clock.advance(PERIOD);
        assert!(!h.controller.guard().check());
    }
    h.clock.advance(PERIOD);
    assert!(h.controller.guard().check());

    for _ in 0..10 {
        h.clock.advance(PERIOD);
        assert!(!h.controller.guard().check());
    }

    assert_eq!(h.controller.guard().panic_count_for(PanicReason::Watchdog), 1);
    assert_eq!(h.beeps.load(Ordering::SeqCst), 2);
    assert_fully_off(&h);
}

#[test]
fn silent_capture_trips_while_events_are_pumped() {
    let h = harness();
    h.controller.enable(true).unwrap();
    h.capture.emit(1, Some(&frame()));

    let mut trips = 0;
    for _ in 0..1000 {
        h.clock.advance(Duration::from_millis(20));
        h.controller.pump_events();
        if h.controller.guard().check() {
            trips += 1;
        }
    }

    assert_eq!(trips, 1);
    assert_eq!(h.probe.present_count(), 1);
    assert_eq!(h.controller.guard().panic_count_for(PanicReason::Watchdog), 1);
    assert_fully_off(&h);
}

#[test]
fn idle_overlay_never_trips() {
    let h = harness();
    for _ in 0..50 {
        h.clock.advance(PERIOD);
        assert!(!h.controller.guard().check());
    }
    assert!(!h.controller.is_in_safe_mode());
}

#[test]
fn panic_runs_every_callback_despite_failures() {
    let h = harness();
    h.controller.enable(true).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for i in 0..4 {
        let calls = Arc::clone(&calls);
        let order = Arc::clone(&order);
        h.controller.register_panic_callback(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            order.lock().push(i);
            match i {
                1 => anyhow::bail!("callback {} refused", i),
                2 => panic!("callback {} blew up", i),
                _ => Ok(()),
            }
        });
    }

    h.controller.panic_off();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    assert_fully_off(&h);

    h.controller.panic_off();
    assert_eq!(calls.load(Ordering::SeqCst), 8);
    assert!(h.controller.is_in_safe_mode());
}

#[test]
fn enable_is_refused_in_safe_mode() {
    let h = harness();
    h.controller.guard().startup_check(true);

    assert!(matches!(h.controller.enable(true), Err(ControlError::SafeModeActive)));
    assert!(!h.controller.is_enabled());
    assert_eq!(h.capture.open_count(), 0);

    h.controller.exit_safe_mode();
    assert!(!h.controller.is_enabled());
    h.controller.enable(true).unwrap();
    assert!(h.controller.is_enabled());
}

#[test]
fn panic_completes_while_a_frame_is_stuck_rendering() {
    let h = harness();
    h.controller.enable(true).unwrap();

    let stall = h.probe.stall_next_draw();
    let capture = h.capture.clone();
    let stuck = std::thread::spawn(move || capture.emit(1, Some(&frame())));
    stall
        .entered
        .recv_timeout(Duration::from_secs(5))
        .expect("frame reached the surface");

    assert_eq!(h.controller.surface_state(), SurfaceState::Ready);
    h.controller.panic_off();
    assert_fully_off(&h);

    stall.release.send(()).unwrap();
    assert_eq!(stuck.join().unwrap(), 1);
    assert_eq!(h.probe.present_count(), 0);
}

#[test]
fn parameters_stay_in_range() {
    let h = harness();
    h.controller.set_parameter("contrast", 99.0).unwrap();
    h.controller.set_parameter("gamma", f32::NAN).unwrap();
    h.controller.set_parameter("invert_mode", 1.2).unwrap();
    assert!(h.controller.set_parameter("blur", 0.5).is_err());

    let p = h.controller.parameters();
    assert_eq!(p.contrast, 4.0);
    assert_eq!(p.gamma, 1.0);
    assert_eq!(p.invert_mode, claritylayer::InvertMode::Full);
}
