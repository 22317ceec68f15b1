// Concrete backend pairings for the controller
use crate::capture::simulated::SimulatedCapture;
use crate::capture::Rect;
use crate::controller::{Controller, ControllerOptions};
use crate::error::ControlError;
use crate::surface::headless::HeadlessSurface;

/// CPU device, simulated capture and an offscreen surface.
pub type SoftwareController = Controller<SimulatedCapture, HeadlessSurface>;

pub fn software(capture: SimulatedCapture, desktop: Rect, options: ControllerOptions) -> Result<SoftwareController, ControlError> {
    Controller::new(capture, HeadlessSurface::new(desktop), options)
}

#[cfg(windows)]
pub use self::windows_platform::*;

#[cfg(windows)]
mod windows_platform {
    use crate::capture::wgc::WgcCapture;
    use crate::controller::{Controller, ControllerOptions};
    use crate::error::ControlError;
    use crate::surface::dcomp::DCompSurface;
    use claritylayer_core::{log_info, log_warn, AppConfig};
    use windows::Win32::System::Com::{CoInitializeEx, COINIT_MULTITHREADED};
    use windows::Win32::UI::HiDpi::{SetProcessDpiAwarenessContext, DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2};

    /// Windows Graphics Capture into a DirectComposition overlay.
    pub type WindowsController = Controller<WgcCapture, DCompSurface>;

    /// Per-monitor DPI awareness and a multithreaded apartment for WinRT capture.
    pub fn prepare_process() {
        unsafe {
            if let Err(e) = SetProcessDpiAwarenessContext(DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2) {
                log_warn!("Per-monitor DPI awareness unavailable: {}", e);
            }
            if let Err(e) = CoInitializeEx(None, COINIT_MULTITHREADED).ok() {
                log_warn!("CoInitializeEx failed: {}", e);
            }
        }
    }

    pub fn windows(config: &AppConfig, options: ControllerOptions) -> Result<WindowsController, ControlError> {
        log_info!("Using Windows Graphics Capture with DirectComposition (tearing {})", if config.allow_tearing { "allowed" } else { "off" });
        Controller::new(WgcCapture::new(), DCompSurface::new(config.allow_tearing), options)
    }
}
