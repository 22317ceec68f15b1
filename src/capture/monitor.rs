use super::{MonitorDescriptor, Rect, DEFAULT_DPI};
use crate::error::CaptureError;
use windows::{
    core::BOOL,
    Win32::Foundation::{LPARAM, RECT},
    Win32::Graphics::Gdi::{EnumDisplayMonitors, GetMonitorInfoW, HDC, HMONITOR, MONITORINFOEXW},
    Win32::UI::HiDpi::{GetDpiForMonitor, MDT_EFFECTIVE_DPI},
};

const MONITORINFOF_PRIMARY: u32 = 1;

/// Lists every attached monitor with its bounds and effective DPI.
pub fn enumerate() -> Result<Vec<MonitorDescriptor>, CaptureError> {
    let mut monitors: Vec<MonitorDescriptor> = Vec::new();

    let ok = unsafe {
        EnumDisplayMonitors(
            None,
            None,
            Some(monitor_enum_proc),
            LPARAM(&mut monitors as *mut _ as isize),
        )
    };

    if !ok.as_bool() && monitors.is_empty() {
        return Err(CaptureError::Enumeration("EnumDisplayMonitors failed".to_string()));
    }
    Ok(monitors)
}

pub fn to_hmonitor(handle: isize) -> HMONITOR {
    HMONITOR(handle as *mut _)
}

unsafe extern "system" fn monitor_enum_proc(
    hmonitor: HMONITOR,
    _hdc: HDC,
    _rect: *mut RECT,
    lparam: LPARAM,
) -> BOOL {
    let monitors = &mut *(lparam.0 as *mut Vec<MonitorDescriptor>);

    let mut info: MONITORINFOEXW = std::mem::zeroed();
    info.monitorInfo.cbSize = std::mem::size_of::<MONITORINFOEXW>() as u32;

    if GetMonitorInfoW(hmonitor, &mut info as *mut _ as *mut _).as_bool() {
        let rect = info.monitorInfo.rcMonitor;
        let len = info
            .szDevice
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(info.szDevice.len());

        let mut dpi_x = 0u32;
        let mut dpi_y = 0u32;
        let dpi = match GetDpiForMonitor(hmonitor, MDT_EFFECTIVE_DPI, &mut dpi_x, &mut dpi_y) {
            Ok(()) if dpi_x > 0 => dpi_x,
            _ => DEFAULT_DPI,
        };

        monitors.push(MonitorDescriptor {
            handle: hmonitor.0 as isize,
            name: String::from_utf16_lossy(&info.szDevice[..len]),
            bounds: Rect::new(rect.left, rect.top, rect.right, rect.bottom),
            dpi,
            is_primary: info.monitorInfo.dwFlags & MONITORINFOF_PRIMARY != 0,
        });
    }

    true.into()
}
