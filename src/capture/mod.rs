// Per-monitor frame capture with scoped sessions and lock-free delivery
pub mod simulated;

#[cfg(windows)]
pub mod monitor;
#[cfg(windows)]
pub mod wgc;

use crate::error::CaptureError;
use crate::gpu::{DeviceHandle, RenderDevice};
use claritylayer_core::{log_info, log_warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }
}

pub const DEFAULT_DPI: u32 = 96;

/// A connected display, enumerated fresh on every display change.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorDescriptor {
    pub handle: isize,
    pub name: String,
    pub bounds: Rect,
    pub dpi: u32,
    pub is_primary: bool,
}

impl MonitorDescriptor {
    pub fn scale_factor(&self) -> f32 {
        self.dpi as f32 / DEFAULT_DPI as f32
    }
}

/// Bounding box of every monitor, i.e. the virtual desktop.
pub fn virtual_bounds(monitors: &[MonitorDescriptor]) -> Rect {
    monitors
        .iter()
        .fold(Rect::default(), |acc, m| acc.union(&m.bounds))
}

/// A frame texture lent to the frame callback for the duration of one call.
pub struct FrameHandle<'a, T> {
    texture: &'a T,
    monitor: isize,
}

impl<'a, T> FrameHandle<'a, T> {
    pub fn texture(&self) -> &'a T {
        self.texture
    }

    pub fn monitor(&self) -> isize {
        self.monitor
    }
}

pub type FrameCallback<T> = Arc<dyn Fn(&FrameHandle<'_, T>) + Send + Sync>;

type CallbackSlot<T> = Arc<Mutex<Option<FrameCallback<T>>>>;

/// Delivery endpoint a backend invokes from its capture thread.
pub struct FrameSink<T> {
    callback: CallbackSlot<T>,
    live: Arc<AtomicBool>,
    monitor: isize,
}

impl<T> Clone for FrameSink<T> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
            live: Arc::clone(&self.live),
            monitor: self.monitor,
        }
    }
}

impl<T: Clone> FrameSink<T> {
    /// Hands an acquired frame to the registered callback.
    ///
    /// `None` means the pool had nothing ready and is silently ignored. Frames
    /// arriving after the session was torn down are dropped. Returns whether
    /// the callback ran.
    pub fn deliver(&self, frame: Option<&T>) -> bool {
        if !self.live.load(Ordering::Acquire) {
            return false;
        }
        let Some(texture) = frame else {
            return false;
        };

        // Swap is guarded, invocation is not
        let callback = self.callback.lock().clone();
        let Some(callback) = callback else {
            return false;
        };

        let held = texture.clone();
        callback(&FrameHandle {
            texture: &held,
            monitor: self.monitor,
        });
        drop(held);
        true
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn monitor(&self) -> isize {
        self.monitor
    }
}

/// Backend half of one capture session.
pub trait CaptureStream: Send {
    /// Detaches the frame-arrival handler.
    fn unsubscribe(&mut self);
    fn close_session(&mut self);
    fn close_pool(&mut self);
}

/// OS capture service able to open one stream per monitor.
pub trait CaptureBackend: Send + Sync + 'static {
    type Device: RenderDevice;
    type Stream: CaptureStream;

    fn is_supported(&self) -> bool;

    fn enumerate_monitors(&self) -> Result<Vec<MonitorDescriptor>, CaptureError>;

    /// Opens and starts a stream that feeds `sink` from its own thread.
    fn open(
        &self,
        device: &Arc<Self::Device>,
        monitor: &MonitorDescriptor,
        sink: FrameSink<<Self::Device as RenderDevice>::Texture>,
    ) -> Result<Self::Stream, CaptureError>;
}

/// Scoped capture session. Teardown runs exactly once, on `close` or drop.
pub struct CaptureSession<S: CaptureStream> {
    monitor: MonitorDescriptor,
    stream: S,
    live: Arc<AtomicBool>,
    closed: bool,
}

impl<S: CaptureStream> CaptureSession<S> {
    fn new(monitor: MonitorDescriptor, stream: S, live: Arc<AtomicBool>) -> Self {
        Self {
            monitor,
            stream,
            live,
            closed: false,
        }
    }

    pub fn monitor(&self) -> &MonitorDescriptor {
        &self.monitor
    }

    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.live.store(false, Ordering::Release);
        self.stream.unsubscribe();
        self.stream.close_session();
        self.stream.close_pool();
    }
}

impl<S: CaptureStream> Drop for CaptureSession<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}

type TextureOf<B> = <<B as CaptureBackend>::Device as RenderDevice>::Texture;

/// Owns every capture session and routes their frames to one callback.
pub struct FrameSource<B: CaptureBackend> {
    backend: B,
    device: RwLock<Option<DeviceHandle<B::Device>>>,
    monitors: RwLock<Vec<MonitorDescriptor>>,
    sessions: Mutex<Vec<CaptureSession<B::Stream>>>,
    callback: CallbackSlot<TextureOf<B>>,
}

impl<B: CaptureBackend> FrameSource<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            device: RwLock::new(None),
            monitors: RwLock::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            callback: Arc::new(Mutex::new(None)),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Binds to the shared device and takes the first monitor snapshot.
    pub fn initialize(&self, device: DeviceHandle<B::Device>) -> Result<(), CaptureError> {
        if device.current().is_none() {
            return Err(CaptureError::NoDevice);
        }
        *self.device.write() = Some(device);
        let count = self.refresh_monitors()?;
        log_info!("Frame source initialized with {} monitor(s)", count);
        Ok(())
    }

    pub fn refresh_monitors(&self) -> Result<usize, CaptureError> {
        let monitors = self.backend.enumerate_monitors()?;
        for m in &monitors {
            tracing::debug!(
                "Monitor {} at ({}, {}) {}x{} dpi {}{}",
                m.name,
                m.bounds.left,
                m.bounds.top,
                m.bounds.width(),
                m.bounds.height(),
                m.dpi,
                if m.is_primary { " primary" } else { "" }
            );
        }
        let count = monitors.len();
        *self.monitors.write() = monitors;
        Ok(count)
    }

    /// Opens one session per known monitor. Returns the active session count.
    pub fn start(&self) -> Result<usize, CaptureError> {
        let mut sessions = self.sessions.lock();
        if !sessions.is_empty() {
            return Ok(sessions.len());
        }

        if !self.backend.is_supported() {
            return Err(CaptureError::Unsupported);
        }

        let device = self
            .device
            .read()
            .as_ref()
            .and_then(|handle| handle.current())
            .ok_or(CaptureError::NoDevice)?;

        let monitors = self.monitors.read().clone();
        for monitor in monitors {
            let live = Arc::new(AtomicBool::new(true));
            let sink = FrameSink {
                callback: Arc::clone(&self.callback),
                live: Arc::clone(&live),
                monitor: monitor.handle,
            };

            match self.backend.open(&device, &monitor, sink) {
                Ok(stream) => {
                    log_info!("Capture session started for {}", monitor.name);
                    sessions.push(CaptureSession::new(monitor, stream, live));
                }
                Err(e) => {
                    live.store(false, Ordering::Release);
                    log_warn!("Skipping monitor {}: {}", monitor.name, e);
                }
            }
        }

        if sessions.is_empty() {
            return Err(CaptureError::NoSessions);
        }
        Ok(sessions.len())
    }

    /// Tears every session down in unsubscribe, session, pool order.
    pub fn stop(&self) {
        let mut sessions = self.sessions.lock();
        if sessions.is_empty() {
            return;
        }
        let count = sessions.len();
        for session in sessions.drain(..) {
            session.close();
        }
        log_info!("Stopped {} capture session(s)", count);
    }

    pub fn restart(&self) -> Result<usize, CaptureError> {
        self.stop();
        self.refresh_monitors()?;
        self.start()
    }

    pub fn on_display_change(&self) -> Result<usize, CaptureError> {
        self.restart()
    }

    pub fn set_frame_callback(&self, callback: FrameCallback<TextureOf<B>>) {
        *self.callback.lock() = Some(callback);
    }

    pub fn clear_frame_callback(&self) {
        *self.callback.lock() = None;
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_running(&self) -> bool {
        !self.sessions.lock().is_empty()
    }

    pub fn monitors(&self) -> Vec<MonitorDescriptor> {
        self.monitors.read().clone()
    }
}

impl<B: CaptureBackend> Drop for FrameSource<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::simulated::{SimulatedCapture, TeardownStep};
    use super::*;
    use crate::gpu::software::{SoftTexture, SoftwareDevice};
    use crate::gpu::{DeviceSlot, Extent};
    use std::sync::atomic::AtomicUsize;

    fn source(monitors: usize) -> (FrameSource<SimulatedCapture>, SimulatedCapture, DeviceSlot<SoftwareDevice>) {
        let capture = SimulatedCapture::with_monitors(monitors);
        let slot = DeviceSlot::new();
        slot.publish(Arc::new(SoftwareDevice::new()));
        let source = FrameSource::new(capture.clone());
        source.initialize(slot.handle()).unwrap();
        (source, capture, slot)
    }

    #[test]
    fn test_virtual_bounds_spans_all_monitors() {
        let capture = SimulatedCapture::with_monitors(2);
        let monitors = capture.enumerate_monitors().unwrap();
        let bounds = virtual_bounds(&monitors);
        assert_eq!(bounds, Rect::new(0, 0, 3840, 1080));
    }

    #[test]
    fn test_initialize_requires_device() {
        let source = FrameSource::new(SimulatedCapture::with_monitors(1));
        let slot: DeviceSlot<SoftwareDevice> = DeviceSlot::new();
        assert!(matches!(source.initialize(slot.handle()), Err(CaptureError::NoDevice)));
    }

    #[test]
    fn test_start_skips_failing_monitor() {
        let (source, capture, _slot) = source(3);
        capture.fail_monitor(2);
        assert_eq!(source.start().unwrap(), 2);
    }

    #[test]
    fn test_start_fails_with_zero_sessions() {
        let (source, capture, _slot) = source(1);
        capture.fail_monitor(1);
        assert!(matches!(source.start(), Err(CaptureError::NoSessions)));
        assert!(!source.is_running());
    }

    #[test]
    fn test_start_requires_capture_service() {
        let (source, capture, _slot) = source(1);
        capture.set_supported(false);
        assert!(matches!(source.start(), Err(CaptureError::Unsupported)));
    }

    #[test]
    fn test_start_is_idempotent_while_running() {
        let (source, capture, _slot) = source(2);
        assert_eq!(source.start().unwrap(), 2);
        assert_eq!(source.start().unwrap(), 2);
        assert_eq!(capture.open_count(), 2);
    }

    #[test]
    fn test_stop_tears_down_in_order() {
        let (source, capture, _slot) = source(1);
        source.start().unwrap();
        source.stop();
        source.stop();
        assert_eq!(
            capture.teardown_log(),
            vec![
                TeardownStep::Unsubscribe(1),
                TeardownStep::CloseSession(1),
                TeardownStep::ClosePool(1),
            ]
        );
    }

    #[test]
    fn test_empty_pool_is_silent() {
        let (source, capture, _slot) = source(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        source.set_frame_callback(Arc::new(move |_frame: &FrameHandle<'_, SoftTexture>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        source.start().unwrap();
        assert_eq!(capture.emit(1, None), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_delivery_extends_texture_lifetime_during_callback() {
        let (source, capture, _slot) = source(1);
        let frame = SoftTexture::filled(Extent::new(2, 2), [0.5; 4]);
        let seen = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&seen);
        source.set_frame_callback(Arc::new(move |handle: &FrameHandle<'_, SoftTexture>| {
            observed.store(handle.texture().holders(), Ordering::SeqCst);
        }));
        source.start().unwrap();

        let before = frame.holders();
        assert_eq!(capture.emit(1, Some(&frame)), 1);
        assert_eq!(seen.load(Ordering::SeqCst), before + 1);
        assert_eq!(frame.holders(), before);
    }

    #[test]
    fn test_replacing_callback_routes_new_frames() {
        let (source, capture, _slot) = source(1);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&first);
        source.set_frame_callback(Arc::new(move |_: &FrameHandle<'_, SoftTexture>| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        source.start().unwrap();

        let frame = SoftTexture::filled(Extent::new(1, 1), [0.0; 4]);
        capture.emit(1, Some(&frame));

        let s = Arc::clone(&second);
        source.set_frame_callback(Arc::new(move |_: &FrameHandle<'_, SoftTexture>| {
            s.fetch_add(1, Ordering::SeqCst);
        }));
        capture.emit(1, Some(&frame));

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
