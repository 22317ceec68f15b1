// Offscreen surface over the software device, with fault injection
use super::{PresentStatus, SurfaceBackend, WindowControl};
use crate::capture::Rect;
use crate::error::SurfaceError;
use crate::gpu::software::{SoftTexture, SoftwareDevice};
use crate::gpu::Extent;
use crossbeam_channel::{bounded, Receiver, Sender};
use image::{Rgba, Rgba32FImage};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct ProbeState {
    desktop: Rect,
    remove_next: bool,
    reset_next: bool,
    fail_device_creation: bool,
    fail_resize: bool,
    window_visible: bool,
    device_creations: usize,
    draws: usize,
    presents: usize,
    releases: usize,
    back_buffer: Option<Extent>,
    last_frame: Option<Rgba32FImage>,
    stall: Option<(Sender<()>, Receiver<()>)>,
}

/// A draw that blocks until `release` fires or is dropped.
pub struct DrawStall {
    /// Signalled once the draw is blocked.
    pub entered: Receiver<()>,
    pub release: Sender<()>,
}

/// Test-side view into a `HeadlessSurface`.
#[derive(Clone, Default)]
pub struct HeadlessProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl HeadlessProbe {
    pub fn remove_device_on_next_present(&self) {
        self.state.lock().remove_next = true;
    }

    pub fn reset_device_on_next_present(&self) {
        self.state.lock().reset_next = true;
    }

    pub fn fail_device_creation(&self, fail: bool) {
        self.state.lock().fail_device_creation = fail;
    }

    pub fn fail_resize(&self, fail: bool) {
        self.state.lock().fail_resize = fail;
    }

    /// Freezes the next draw, as a hung driver would.
    pub fn stall_next_draw(&self) -> DrawStall {
        let (entered_tx, entered) = bounded(1);
        let (release, release_rx) = bounded(1);
        self.state.lock().stall = Some((entered_tx, release_rx));
        DrawStall { entered, release }
    }

    pub fn set_desktop(&self, desktop: Rect) {
        self.state.lock().desktop = desktop;
    }

    pub fn is_window_visible(&self) -> bool {
        self.state.lock().window_visible
    }

    pub fn device_creations(&self) -> usize {
        self.state.lock().device_creations
    }

    pub fn draw_count(&self) -> usize {
        self.state.lock().draws
    }

    pub fn present_count(&self) -> usize {
        self.state.lock().presents
    }

    pub fn release_count(&self) -> usize {
        self.state.lock().releases
    }

    pub fn back_buffer_extent(&self) -> Option<Extent> {
        self.state.lock().back_buffer
    }

    /// Contents of the most recently presented back buffer.
    pub fn last_frame(&self) -> Option<Rgba32FImage> {
        self.state.lock().last_frame.clone()
    }
}

struct HeadlessWindow {
    probe: HeadlessProbe,
}

impl WindowControl for HeadlessWindow {
    fn set_visible(&self, visible: bool) {
        self.probe.state.lock().window_visible = visible;
    }
}

pub struct HeadlessSurface {
    probe: HeadlessProbe,
    back_buffer: Option<Rgba32FImage>,
    geometry: bool,
}

impl HeadlessSurface {
    pub fn new(desktop: Rect) -> Self {
        let probe = HeadlessProbe::default();
        probe.set_desktop(desktop);
        Self {
            probe,
            back_buffer: None,
            geometry: false,
        }
    }

    pub fn probe(&self) -> HeadlessProbe {
        self.probe.clone()
    }

    fn allocate(&mut self, bounds: Rect) -> Result<(), SurfaceError> {
        if bounds.is_empty() {
            return Err(SurfaceError::SwapChain("empty desktop".to_string()));
        }
        let extent = Extent::new(bounds.width() as u32, bounds.height() as u32);
        self.back_buffer = Some(Rgba32FImage::new(extent.width, extent.height));
        self.probe.state.lock().back_buffer = Some(extent);
        Ok(())
    }
}

impl SurfaceBackend for HeadlessSurface {
    type Device = SoftwareDevice;

    fn virtual_desktop(&self) -> Result<Rect, SurfaceError> {
        Ok(self.probe.state.lock().desktop)
    }

    fn create_device(&mut self) -> Result<Arc<SoftwareDevice>, SurfaceError> {
        let mut state = self.probe.state.lock();
        if state.fail_device_creation {
            return Err(SurfaceError::Device("simulated device creation failure".to_string()));
        }
        state.device_creations += 1;
        Ok(Arc::new(SoftwareDevice::new()))
    }

    fn create_window(&mut self, _bounds: Rect) -> Result<Arc<dyn WindowControl>, SurfaceError> {
        Ok(Arc::new(HeadlessWindow {
            probe: self.probe.clone(),
        }))
    }

    fn create_swap_chain(&mut self, _device: &Arc<SoftwareDevice>, bounds: Rect) -> Result<(), SurfaceError> {
        self.allocate(bounds)
    }

    fn create_geometry(&mut self, _device: &Arc<SoftwareDevice>) -> Result<(), SurfaceError> {
        self.geometry = true;
        Ok(())
    }

    fn draw(&mut self, _device: &SoftwareDevice, texture: &SoftTexture) -> Result<(), SurfaceError> {
        if !self.geometry {
            return Err(SurfaceError::NotInitialized);
        }

        let stall = self.probe.state.lock().stall.take();
        if let Some((entered, release)) = stall {
            let _ = entered.send(());
            let _ = release.recv();
        }

        let back = self.back_buffer.as_mut().ok_or(SurfaceError::NotInitialized)?;
        let source = texture.snapshot();
        let (sw, sh) = source.dimensions();
        let (dw, dh) = back.dimensions();

        // Full-screen quad: stretch the frame over the whole back buffer
        for (x, y, px) in back.enumerate_pixels_mut() {
            *px = Rgba([0.0; 4]);
            if sw == 0 || sh == 0 {
                continue;
            }
            let sx = (x as u64 * sw as u64 / dw as u64) as u32;
            let sy = (y as u64 * sh as u64 / dh as u64) as u32;
            let src = source.get_pixel(sx, sy).0;
            let inv = 1.0 - src[3];
            for i in 0..4 {
                px.0[i] = src[i] + px.0[i] * inv;
            }
        }

        self.probe.state.lock().draws += 1;
        Ok(())
    }

    fn present(&mut self) -> PresentStatus {
        let mut state = self.probe.state.lock();
        if std::mem::take(&mut state.remove_next) {
            return PresentStatus::DeviceRemoved(Some("DXGI_ERROR_DEVICE_HUNG (simulated)".to_string()));
        }
        if std::mem::take(&mut state.reset_next) {
            return PresentStatus::DeviceReset;
        }
        state.presents += 1;
        state.last_frame = self.back_buffer.clone();
        PresentStatus::Presented
    }

    fn reposition(&mut self, bounds: Rect) -> Result<(), SurfaceError> {
        if bounds.is_empty() {
            return Err(SurfaceError::Window("empty desktop".to_string()));
        }
        Ok(())
    }

    fn resize_buffers(&mut self, bounds: Rect) -> Result<(), SurfaceError> {
        if self.probe.state.lock().fail_resize {
            return Err(SurfaceError::Resize("simulated ResizeBuffers failure".to_string()));
        }
        self.allocate(bounds)
    }

    fn release_device_resources(&mut self) {
        self.back_buffer = None;
        self.geometry = false;
        let mut state = self.probe.state.lock();
        state.back_buffer = None;
        state.releases += 1;
    }
}
