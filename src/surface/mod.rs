// Overlay presentation: shared device ownership, visibility and device-loss recovery
pub mod headless;

#[cfg(windows)]
pub mod dcomp;

use crate::capture::Rect;
use crate::error::SurfaceError;
use crate::gpu::{DeviceHandle, DeviceSlot, RenderDevice};
use claritylayer_core::{log_error, log_info, log_warn};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Uninitialized,
    Ready,
    Lost,
    Failed,
}

impl SurfaceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SurfaceState::Ready,
            2 => SurfaceState::Lost,
            3 => SurfaceState::Failed,
            _ => SurfaceState::Uninitialized,
        }
    }
}

/// Read-only mirror of the surface state for threads outside the render path.
#[derive(Clone)]
pub struct StateWatch {
    state: Arc<AtomicU8>,
}

impl StateWatch {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(SurfaceState::Uninitialized as u8)),
        }
    }

    fn set(&self, state: SurfaceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn get(&self) -> SurfaceState {
        SurfaceState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// What the backend reported for one present call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    DeviceRemoved(Option<String>),
    DeviceReset,
    Failed(String),
}

/// What `PresentationSurface::present` did with the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Skipped,
    Recovered,
    /// The device was lost and could not be rebuilt. The surface is hidden.
    RecoveryFailed,
    Failed,
}

/// Native window visibility. Must be callable from any thread without blocking.
pub trait WindowControl: Send + Sync {
    fn set_visible(&self, visible: bool);
}

/// Cloneable show/hide switch for the overlay window.
#[derive(Clone)]
pub struct Visibility {
    visible: Arc<AtomicBool>,
    window: Arc<RwLock<Option<Arc<dyn WindowControl>>>>,
}

impl Default for Visibility {
    fn default() -> Self {
        Self {
            visible: Arc::new(AtomicBool::new(false)),
            window: Arc::new(RwLock::new(None)),
        }
    }
}

impl Visibility {
    fn attach(&self, window: Arc<dyn WindowControl>) {
        window.set_visible(self.is_visible());
        *self.window.write() = Some(window);
    }

    pub fn show(&self) {
        self.visible.store(true, Ordering::Release);
        if let Some(window) = self.window.read().clone() {
            window.set_visible(true);
        }
    }

    pub fn hide(&self) {
        self.visible.store(false, Ordering::Release);
        if let Some(window) = self.window.read().clone() {
            window.set_visible(false);
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }
}

type TextureOf<B> = <<B as SurfaceBackend>::Device as RenderDevice>::Texture;

/// Platform half of the presentation surface.
///
/// The window is created once and survives device loss. Everything else is
/// device-bound and rebuilt as a whole.
pub trait SurfaceBackend: Send + 'static {
    type Device: RenderDevice;

    fn virtual_desktop(&self) -> Result<Rect, SurfaceError>;

    fn create_device(&mut self) -> Result<Arc<Self::Device>, SurfaceError>;

    /// Always-on-top, click-through, capture-excluded window covering `bounds`.
    fn create_window(&mut self, bounds: Rect) -> Result<Arc<dyn WindowControl>, SurfaceError>;

    fn create_swap_chain(&mut self, device: &Arc<Self::Device>, bounds: Rect) -> Result<(), SurfaceError>;

    /// Quad, sampler and blend state used by `draw`.
    fn create_geometry(&mut self, device: &Arc<Self::Device>) -> Result<(), SurfaceError>;

    /// Clears the back buffer to transparent and draws `texture` over it.
    fn draw(&mut self, device: &Self::Device, texture: &TextureOf<Self>) -> Result<(), SurfaceError>;

    fn present(&mut self) -> PresentStatus;

    fn reposition(&mut self, bounds: Rect) -> Result<(), SurfaceError>;

    fn resize_buffers(&mut self, bounds: Rect) -> Result<(), SurfaceError>;

    fn release_device_resources(&mut self);
}

pub struct PresentationSurface<B: SurfaceBackend> {
    backend: B,
    slot: DeviceSlot<B::Device>,
    state: SurfaceState,
    watch: StateWatch,
    bounds: Rect,
    visibility: Visibility,
    recovery_listeners: Vec<Box<dyn Fn() + Send + Sync>>,
    settle: Duration,
    recoveries: usize,
}

impl<B: SurfaceBackend> PresentationSurface<B> {
    pub fn new(backend: B, settle: Duration) -> Self {
        Self {
            backend,
            slot: DeviceSlot::new(),
            state: SurfaceState::Uninitialized,
            watch: StateWatch::new(),
            bounds: Rect::default(),
            visibility: Visibility::default(),
            recovery_listeners: Vec::new(),
            settle,
            recoveries: 0,
        }
    }

    pub fn initialize(&mut self) -> Result<(), SurfaceError> {
        if self.state == SurfaceState::Ready {
            return Ok(());
        }

        let bounds = self.backend.virtual_desktop()?;
        let device = self.backend.create_device()?;
        let window = self.backend.create_window(bounds)?;
        self.visibility.attach(window);

        if let Err(e) = self.build_chain(&device, bounds) {
            self.backend.release_device_resources();
            return Err(e);
        }

        self.slot.publish(device);
        self.bounds = bounds;
        self.set_state(SurfaceState::Ready);
        log_info!(
            "Presentation surface ready at ({}, {}) {}x{}",
            bounds.left,
            bounds.top,
            bounds.width(),
            bounds.height()
        );
        Ok(())
    }

    fn set_state(&mut self, state: SurfaceState) {
        self.state = state;
        self.watch.set(state);
    }

    fn build_chain(&mut self, device: &Arc<B::Device>, bounds: Rect) -> Result<(), SurfaceError> {
        self.backend.create_swap_chain(device, bounds)?;
        self.backend.create_geometry(device)?;
        Ok(())
    }

    /// Read-only capability for dependents that need the shared device.
    pub fn device_handle(&self) -> DeviceHandle<B::Device> {
        self.slot.handle()
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility.clone()
    }

    /// Registers a callback fired once per successful device recovery.
    pub fn on_device_recovered(&mut self, listener: impl Fn() + Send + Sync + 'static) {
        self.recovery_listeners.push(Box::new(listener));
    }

    pub fn show(&self) -> Result<(), SurfaceError> {
        if self.state != SurfaceState::Ready {
            return Err(SurfaceError::NotInitialized);
        }
        self.visibility.show();
        Ok(())
    }

    pub fn hide(&self) {
        self.visibility.hide();
    }

    pub fn is_visible(&self) -> bool {
        self.visibility.is_visible()
    }

    pub fn state(&self) -> SurfaceState {
        self.state
    }

    pub fn state_watch(&self) -> StateWatch {
        self.watch.clone()
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn recovery_count(&self) -> usize {
        self.recoveries
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn render_frame(&mut self, texture: &TextureOf<B>) -> Result<(), SurfaceError> {
        if !self.visibility.is_visible() || self.state != SurfaceState::Ready {
            return Ok(());
        }
        let device = self.slot.current().ok_or(SurfaceError::NotInitialized)?;
        self.backend.draw(&device, texture)
    }

    pub fn present(&mut self) -> PresentOutcome {
        if self.state != SurfaceState::Ready || !self.visibility.is_visible() {
            return PresentOutcome::Skipped;
        }

        match self.backend.present() {
            PresentStatus::Presented => PresentOutcome::Presented,
            PresentStatus::DeviceRemoved(reason) => {
                log_warn!(
                    "GPU device removed ({})",
                    reason.as_deref().unwrap_or("no reason reported")
                );
                self.recover()
            }
            PresentStatus::DeviceReset => {
                log_warn!("GPU device reset");
                self.recover()
            }
            PresentStatus::Failed(message) => {
                log_warn!("Present failed: {}", message);
                PresentOutcome::Failed
            }
        }
    }

    fn recover(&mut self) -> PresentOutcome {
        self.set_state(SurfaceState::Lost);
        self.backend.release_device_resources();
        self.slot.revoke();

        spin_sleep::sleep(self.settle);

        match self.rebuild() {
            Ok(()) => {
                self.set_state(SurfaceState::Ready);
                self.recoveries += 1;
                log_info!("GPU device recovered (recovery #{})", self.recoveries);
                for listener in &self.recovery_listeners {
                    listener();
                }
                PresentOutcome::Recovered
            }
            Err(e) => {
                self.backend.release_device_resources();
                self.set_state(SurfaceState::Failed);
                self.visibility.hide();
                log_error!("Device recovery failed, overlay hidden: {}", e);
                PresentOutcome::RecoveryFailed
            }
        }
    }

    fn rebuild(&mut self) -> Result<(), SurfaceError> {
        let bounds = self.backend.virtual_desktop()?;
        let device = self.backend.create_device()?;
        self.build_chain(&device, bounds)?;
        if bounds != self.bounds {
            self.backend.reposition(bounds)?;
            self.bounds = bounds;
        }
        self.slot.publish(device);
        Ok(())
    }

    /// Follows the virtual desktop after a monitor or DPI change.
    pub fn on_display_change(&mut self) -> Result<(), SurfaceError> {
        if self.state != SurfaceState::Ready {
            return Ok(());
        }

        let bounds = self.backend.virtual_desktop()?;
        let result = self
            .backend
            .reposition(bounds)
            .and_then(|()| self.backend.resize_buffers(bounds));

        match result {
            Ok(()) => {
                self.bounds = bounds;
                log_info!("Surface resized to {}x{}", bounds.width(), bounds.height());
                Ok(())
            }
            Err(e) => {
                self.visibility.hide();
                log_error!("Surface resize failed, overlay hidden: {}", e);
                Err(e)
            }
        }
    }

    pub fn on_dpi_change(&mut self) -> Result<(), SurfaceError> {
        self.on_display_change()
    }
}

#[cfg(test)]
mod tests {
    use super::headless::HeadlessSurface;
    use super::*;
    use crate::gpu::software::SoftTexture;
    use crate::gpu::Extent;
    use std::sync::atomic::AtomicUsize;

    fn ready() -> (PresentationSurface<HeadlessSurface>, headless::HeadlessProbe) {
        let backend = HeadlessSurface::new(Rect::new(0, 0, 8, 4));
        let probe = backend.probe();
        let mut surface = PresentationSurface::new(backend, Duration::ZERO);
        surface.initialize().unwrap();
        (surface, probe)
    }

    #[test]
    fn test_initialize_publishes_device() {
        let (surface, probe) = ready();
        assert_eq!(surface.state(), SurfaceState::Ready);
        assert!(surface.device_handle().current().is_some());
        assert_eq!(probe.device_creations(), 1);
        assert!(!surface.is_visible());
    }

    #[test]
    fn test_hidden_surface_skips_rendering() {
        let (mut surface, probe) = ready();
        let frame = SoftTexture::filled(Extent::new(8, 4), [0.5; 4]);
        surface.render_frame(&frame).unwrap();
        assert_eq!(surface.present(), PresentOutcome::Skipped);
        assert_eq!(probe.draw_count(), 0);
    }

    #[test]
    fn test_show_hide_toggles_window_only() {
        let (surface, probe) = ready();
        surface.show().unwrap();
        assert!(probe.is_window_visible());
        surface.hide();
        assert!(!probe.is_window_visible());
        assert_eq!(surface.state(), SurfaceState::Ready);
        assert!(surface.device_handle().current().is_some());
    }

    #[test]
    fn test_device_reset_recovers_once() {
        let (mut surface, probe) = ready();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        surface.on_device_recovered(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        surface.show().unwrap();

        probe.reset_device_on_next_present();
        assert_eq!(surface.present(), PresentOutcome::Recovered);
        assert_eq!(surface.present(), PresentOutcome::Presented);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(probe.device_creations(), 2);
    }

    #[test]
    fn test_state_watch_follows_recovery() {
        let (mut surface, probe) = ready();
        let watch = surface.state_watch();
        assert_eq!(watch.get(), SurfaceState::Ready);
        surface.show().unwrap();

        probe.fail_device_creation(true);
        probe.remove_device_on_next_present();
        assert_eq!(surface.present(), PresentOutcome::RecoveryFailed);
        assert_eq!(watch.get(), SurfaceState::Failed);
        assert_eq!(surface.state(), SurfaceState::Failed);
    }

    #[test]
    fn test_display_change_follows_new_desktop() {
        let (mut surface, probe) = ready();
        probe.set_desktop(Rect::new(-1920, 0, 1920, 1080));
        surface.on_display_change().unwrap();
        assert_eq!(surface.bounds(), Rect::new(-1920, 0, 1920, 1080));
        assert_eq!(probe.back_buffer_extent(), Some(Extent::new(3840, 1080)));
    }
}
