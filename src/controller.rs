// Owns the frame chain and implements the command, query and event surface
use crate::capture::{CaptureBackend, FrameHandle, FrameSource, MonitorDescriptor};
use crate::error::ControlError;
use crate::events::{Command, ControlEvent, EventHub, EventSender};
use crate::gpu::{RenderDevice, ShaderAssets};
use crate::guard::{AudioFeedback, Clock, LivenessGuard, MonotonicClock, PanicReason, PipelineOwner, Sound, DEFAULT_PERIOD};
use crate::surface::{
    PresentOutcome, PresentationSurface, StateWatch, SurfaceBackend, SurfaceState, Visibility, DEFAULT_SETTLE,
};
use crate::transform::{SharedParameters, TransformPipeline};
use claritylayer_core::{log_error, log_info, log_warn, AppConfig, StateManager, TransformParameters, VisualProfile};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

type TextureOf<S> = <<S as SurfaceBackend>::Device as RenderDevice>::Texture;

pub struct ControllerOptions {
    pub shaders: ShaderAssets,
    pub settle: Duration,
    pub watchdog_period: Duration,
    pub clock: Arc<dyn Clock>,
    pub audio: AudioFeedback,
    pub parameters: TransformParameters,
    pub profile: String,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            shaders: ShaderAssets::builtin(),
            settle: DEFAULT_SETTLE,
            watchdog_period: DEFAULT_PERIOD,
            clock: Arc::new(MonotonicClock::default()),
            audio: AudioFeedback::silent(),
            parameters: TransformParameters::default(),
            profile: "identity".to_string(),
        }
    }
}

impl ControllerOptions {
    pub fn from_config(config: &AppConfig, sounds_dir: Option<PathBuf>) -> Self {
        let shaders = match &config.shaders_dir {
            Some(dir) => ShaderAssets::load_dir(dir).with_builtin_fallback(),
            None => ShaderAssets::builtin(),
        };
        let (profile, parameters) = match VisualProfile::builtin(&config.default_profile) {
            Ok(p) => (p.name, p.parameters),
            Err(e) => {
                log_warn!("{}, falling back to identity", e);
                ("identity".to_string(), TransformParameters::default())
            }
        };

        Self {
            shaders,
            settle: Duration::from_millis(config.device_settle_ms),
            watchdog_period: Duration::from_millis(config.watchdog_period_ms.max(1)),
            clock: Arc::new(MonotonicClock::default()),
            audio: AudioFeedback::system(sounds_dir, config.sounds_enabled),
            parameters,
            profile,
        }
    }
}

/// Everything the render thread touches. Holding the lock is being the render thread.
struct RenderPath<S: SurfaceBackend> {
    pipeline: TransformPipeline<S::Device>,
    surface: PresentationSurface<S>,
}

impl<S: SurfaceBackend> RenderPath<S> {
    fn draw(&mut self, texture: &TextureOf<S>) -> Result<PresentOutcome, ControlError> {
        if !self.surface.is_visible() {
            return Ok(PresentOutcome::Skipped);
        }
        let output = self.pipeline.process(texture)?;
        self.surface.render_frame(output)?;
        Ok(self.surface.present())
    }
}

struct Core<C: CaptureBackend, S: SurfaceBackend<Device = C::Device>> {
    source: FrameSource<C>,
    render: Mutex<RenderPath<S>>,
    visibility: Visibility,
    surface_state: StateWatch,
    events: EventSender,
    guard: Arc<LivenessGuard>,
    enabled: AtomicBool,
    failures: AtomicU64,
}

impl<C, S> Core<C, S>
where
    C: CaptureBackend,
    S: SurfaceBackend<Device = C::Device>,
{
    fn on_frame(&self, texture: &TextureOf<S>) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        let mut render = self.render.lock();
        // Panic-off may have landed while we waited
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        let result = render.draw(texture);
        drop(render);
        self.record(result);
    }

    fn record(&self, result: Result<PresentOutcome, ControlError>) {
        match result {
            Ok(PresentOutcome::Presented) => {
                self.guard.heartbeat();
                self.failures.store(0, Ordering::Release);
            }
            Ok(PresentOutcome::Skipped) | Ok(PresentOutcome::Recovered) => {}
            Ok(PresentOutcome::RecoveryFailed) => {
                log_error!("GPU device could not be recovered, disabling effects");
                self.shut_off();
                self.events.send(ControlEvent::SurfaceFailed);
            }
            Ok(PresentOutcome::Failed) => self.note_failure("present failed"),
            Err(e) => self.note_failure(&e.to_string()),
        }
    }

    fn note_failure(&self, message: &str) {
        let count = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if count == 1 || count % 120 == 0 {
            log_warn!("Frame not rendered ({} consecutive): {}", count, message);
        }
    }

    /// Stops output without touching the render lock.
    fn shut_off(&self) {
        self.enabled.store(false, Ordering::Release);
        self.guard.disarm();
        self.source.stop();
        self.visibility.hide();
    }
}

impl<C, S> PipelineOwner for Core<C, S>
where
    C: CaptureBackend,
    S: SurfaceBackend<Device = C::Device>,
{
    fn disable_all_effects(&self) {
        self.shut_off();
        log_info!("All effects disabled");
    }
}

pub struct Controller<C: CaptureBackend, S: SurfaceBackend<Device = C::Device>> {
    core: Arc<Core<C, S>>,
    params: Arc<SharedParameters>,
    events: EventHub,
    profile: Mutex<String>,
    state: Option<Arc<StateManager>>,
}

impl<C, S> Controller<C, S>
where
    C: CaptureBackend,
    S: SurfaceBackend<Device = C::Device>,
{
    /// Brings up the surface, the pipeline and the frame source, in that order.
    pub fn new(capture: C, surface: S, options: ControllerOptions) -> Result<Self, ControlError> {
        let mut surface = PresentationSurface::new(surface, options.settle);
        surface.initialize()?;

        let params = Arc::new(SharedParameters::new(options.parameters));
        let mut pipeline = TransformPipeline::new(surface.device_handle(), options.shaders, Arc::clone(&params));
        pipeline.initialize()?;

        let events = EventHub::new();
        surface.on_device_recovered(pipeline.recovery_listener());
        let recovered = events.sender();
        surface.on_device_recovered(move || {
            recovered.send(ControlEvent::DeviceRecovered);
        });

        let source = FrameSource::new(capture);
        source.initialize(surface.device_handle())?;

        let visibility = surface.visibility();
        let surface_state = surface.state_watch();
        let guard = Arc::new(LivenessGuard::new(options.clock, options.watchdog_period, options.audio));

        let core = Arc::new(Core {
            source,
            render: Mutex::new(RenderPath { pipeline, surface }),
            visibility,
            surface_state,
            events: events.sender(),
            guard,
            enabled: AtomicBool::new(false),
            failures: AtomicU64::new(0),
        });

        let weak_core: Weak<Core<C, S>> = Arc::downgrade(&core);
        let owner: Weak<dyn PipelineOwner> = weak_core.clone();
        core.guard.set_owner(owner);

        core.source
            .set_frame_callback(Arc::new(move |frame: &FrameHandle<'_, TextureOf<S>>| {
                if let Some(core) = weak_core.upgrade() {
                    core.on_frame(frame.texture());
                }
            }));

        log_info!("Controller ready with profile '{}'", options.profile);
        Ok(Self {
            core,
            params,
            events,
            profile: Mutex::new(options.profile),
            state: None,
        })
    }

    /// Loads the last parameters from `state` and persists changes back to it.
    pub fn with_state(mut self, state: Arc<StateManager>) -> Self {
        let (params, profile) = state.read(|s| (s.parameters, s.profile_name.clone()));
        self.params.replace(params);
        *self.profile.lock() = profile;
        self.state = Some(state);
        self
    }

    pub fn guard(&self) -> &Arc<LivenessGuard> {
        &self.core.guard
    }

    pub fn event_sender(&self) -> EventSender {
        self.events.sender()
    }

    pub fn visibility(&self) -> Visibility {
        self.core.visibility.clone()
    }

    pub fn register_panic_callback(&self, callback: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static) {
        self.core.guard.register_panic_callback(callback);
    }

    pub fn backend(&self) -> &C {
        self.core.source.backend()
    }

    // Commands

    pub fn enable(&self, on: bool) -> Result<(), ControlError> {
        if on {
            self.turn_on()?;
        } else if self.core.enabled.load(Ordering::Acquire) {
            self.core.shut_off();
            self.core.guard.audio().play(Sound::Disable);
            log_info!("Effects disabled");
        }
        self.persist();
        Ok(())
    }

    fn turn_on(&self) -> Result<(), ControlError> {
        let core = &self.core;
        if core.guard.is_in_safe_mode() {
            log_warn!("Enable refused: safe mode is active");
            core.guard.audio().play(Sound::Error);
            return Err(ControlError::SafeModeActive);
        }
        if core.enabled.load(Ordering::Acquire) {
            return Ok(());
        }

        let sessions = core.source.start()?;
        let shown = core.render.lock().surface.show();
        if let Err(e) = shown {
            core.source.stop();
            return Err(e.into());
        }

        core.failures.store(0, Ordering::Release);
        core.enabled.store(true, Ordering::Release);
        core.guard.arm();
        core.guard.audio().play(Sound::Enable);
        log_info!("Effects enabled on {} monitor(s)", sessions);
        Ok(())
    }

    pub fn toggle(&self) -> Result<(), ControlError> {
        self.enable(!self.is_enabled())
    }

    /// Out-of-range values clamp; unknown names fail.
    pub fn set_parameter(&self, name: &str, value: f32) -> Result<(), ControlError> {
        let stored = self.params.set_named(name, value)?;
        tracing::debug!("Parameter {} = {}", name, stored);
        self.persist();
        Ok(())
    }

    pub fn apply_profile(&self, name: &str) -> Result<(), ControlError> {
        let profile = VisualProfile::builtin(name)?;
        self.params.replace(profile.parameters);
        *self.profile.lock() = profile.name;
        self.core.guard.audio().play(Sound::ProfileSwitch);
        log_info!("Applied profile '{}'", name);
        self.persist();
        Ok(())
    }

    /// Always reachable. Never waits on the render path.
    pub fn panic_off(&self) {
        self.core.guard.panic_off(PanicReason::User);
        self.persist();
    }

    pub fn exit_safe_mode(&self) {
        self.core.guard.exit_safe_mode();
    }

    pub fn execute(&self, command: Command) -> Result<(), ControlError> {
        match command {
            Command::Enable(on) => self.enable(on),
            Command::Toggle => self.toggle(),
            Command::SetParameter { name, value } => self.set_parameter(&name, value),
            Command::ApplyProfile(name) => self.apply_profile(&name),
            Command::PanicOff => {
                self.panic_off();
                Ok(())
            }
            Command::ExitSafeMode => {
                self.exit_safe_mode();
                Ok(())
            }
        }
    }

    // Queries

    pub fn is_enabled(&self) -> bool {
        self.core.enabled.load(Ordering::Acquire)
    }

    pub fn is_in_safe_mode(&self) -> bool {
        self.core.guard.is_in_safe_mode()
    }

    pub fn parameters(&self) -> TransformParameters {
        self.params.snapshot()
    }

    pub fn profile_name(&self) -> String {
        self.profile.lock().clone()
    }

    pub fn monitors(&self) -> Vec<MonitorDescriptor> {
        self.core.source.monitors()
    }

    pub fn session_count(&self) -> usize {
        self.core.source.session_count()
    }

    pub fn surface_state(&self) -> SurfaceState {
        self.core.surface_state.get()
    }

    // Events

    /// Drains the event queue on the calling (main) thread.
    pub fn pump_events(&self) -> usize {
        let events = self.events.drain();
        let count = events.len();
        for event in events {
            self.handle(event);
        }
        count
    }

    fn handle(&self, event: ControlEvent) {
        match event {
            ControlEvent::DisplayChanged => self.on_display_change(false),
            ControlEvent::DpiChanged => self.on_display_change(true),
            ControlEvent::SystemResumed => {
                log_info!("System resumed");
                self.restart_capture();
            }
            ControlEvent::DeviceRecovered => {
                log_info!("Reattaching capture to the recovered device");
                self.restart_capture();
            }
            // Effects were already shut off on the render path
            ControlEvent::SurfaceFailed => self.persist(),
            ControlEvent::Command(command) => {
                let label = format!("{:?}", command);
                if let Err(e) = self.execute(command) {
                    log_warn!("Command {} failed: {}", label, e);
                }
            }
        }
    }

    fn on_display_change(&self, dpi_only: bool) {
        let resized = {
            let mut render = self.core.render.lock();
            if dpi_only {
                render.surface.on_dpi_change()
            } else {
                render.surface.on_display_change()
            }
        };

        if !self.is_enabled() {
            if let Err(e) = self.core.source.refresh_monitors() {
                log_warn!("Monitor refresh failed: {}", e);
            }
            return;
        }

        if let Err(e) = resized {
            log_error!("Overlay cannot follow the new display layout ({}), disabling effects", e);
            self.core.shut_off();
            self.persist();
            return;
        }

        match self.core.source.on_display_change() {
            Ok(sessions) => log_info!("Display layout changed, capturing {} monitor(s)", sessions),
            Err(e) => {
                log_error!("Capture restart failed after display change ({}), disabling effects", e);
                self.core.shut_off();
                self.persist();
            }
        }
    }

    fn restart_capture(&self) {
        if !self.is_enabled() {
            return;
        }
        if let Err(e) = self.core.source.restart() {
            log_error!("Capture restart failed ({}), disabling effects", e);
            self.core.shut_off();
            self.persist();
        }
    }

    fn persist(&self) {
        let Some(state) = &self.state else {
            return;
        };
        let parameters = self.params.snapshot();
        let enabled = self.is_enabled();
        let profile = self.profile_name();
        state.update(|s| {
            s.parameters = parameters;
            s.enhancement_enabled = enabled;
            s.profile_name = profile;
        });
    }

    /// Records the final enabled flag, then stops all output.
    pub fn shutdown(&self) {
        self.persist();
        self.core.source.clear_frame_callback();
        self.core.shut_off();
        log_info!("Controller shut down");
    }
}

impl<C, S> Drop for Controller<C, S>
where
    C: CaptureBackend,
    S: SurfaceBackend<Device = C::Device>,
{
    fn drop(&mut self) {
        self.core.source.clear_frame_callback();
        self.core.shut_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::simulated::SimulatedCapture;
    use crate::capture::Rect;
    use crate::gpu::software::SoftTexture;
    use crate::gpu::Extent;
    use crate::guard::ManualClock;
    use crate::surface::headless::{HeadlessProbe, HeadlessSurface};

    type TestController = Controller<SimulatedCapture, HeadlessSurface>;

    fn controller(monitors: usize) -> (TestController, SimulatedCapture, HeadlessProbe, Arc<ManualClock>) {
        let capture = SimulatedCapture::with_monitors(monitors);
        let surface = HeadlessSurface::new(Rect::new(0, 0, 16, 8));
        let probe = surface.probe();
        let clock = Arc::new(ManualClock::new());
        let options = ControllerOptions {
            settle: Duration::ZERO,
            watchdog_period: Duration::from_millis(100),
            clock: clock.clone(),
            ..ControllerOptions::default()
        };
        let controller = Controller::new(capture.clone(), surface, options).unwrap();
        (controller, capture, probe, clock)
    }

    #[test]
    fn test_enable_shows_and_arms() {
        let (controller, _capture, probe, _clock) = controller(2);
        controller.enable(true).unwrap();
        assert!(controller.is_enabled());
        assert_eq!(controller.session_count(), 2);
        assert!(probe.is_window_visible());
        assert!(controller.guard().is_armed());

        controller.enable(false).unwrap();
        assert_eq!(controller.session_count(), 0);
        assert!(!probe.is_window_visible());
        assert!(!controller.guard().is_armed());
    }

    #[test]
    fn test_frame_feeds_heartbeat() {
        let (controller, capture, probe, clock) = controller(1);
        controller.enable(true).unwrap();
        clock.advance(Duration::from_millis(150));

        let frame = SoftTexture::filled(Extent::new(16, 8), [0.25, 0.5, 0.75, 1.0]);
        assert_eq!(capture.emit(1, Some(&frame)), 1);
        assert_eq!(probe.present_count(), 1);
        assert_eq!(controller.guard().last_heartbeat(), 150);
    }

    #[test]
    fn test_unknown_parameter_is_an_error() {
        let (controller, _capture, _probe, _clock) = controller(1);
        assert!(controller.set_parameter("sharpness", 1.0).is_err());
        controller.set_parameter("edgeStrength", 7.0).unwrap();
        assert_eq!(controller.parameters().edge_strength, 1.0);
    }

    #[test]
    fn test_queued_commands_run_on_pump() {
        let (controller, _capture, _probe, _clock) = controller(1);
        let tx = controller.event_sender();
        tx.command(Command::ApplyProfile("inverted".to_string()));
        tx.command(Command::Enable(true));

        assert_eq!(controller.pump_events(), 2);
        assert!(controller.is_enabled());
        assert_eq!(controller.profile_name(), "inverted");
    }

    #[test]
    fn test_pumping_events_never_feeds_the_heartbeat() {
        let (controller, capture, probe, clock) = controller(1);
        controller.enable(true).unwrap();
        let frame = SoftTexture::filled(Extent::new(16, 8), [0.5; 4]);
        capture.emit(1, Some(&frame));

        let mut trips = 0;
        for _ in 0..100 {
            clock.advance(Duration::from_millis(20));
            controller.pump_events();
            if controller.guard().check() {
                trips += 1;
            }
        }
        assert_eq!(trips, 1);
        assert_eq!(probe.present_count(), 1);
        assert!(controller.is_in_safe_mode());
    }
}
