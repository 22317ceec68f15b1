// Hidden top-level window that turns broadcast system messages into control events
use anyhow::{Context, Result};
use claritylayer::events::{ControlEvent, EventHook};
use claritylayer::log_info;
use windows::{
    core::w,
    Win32::{
        Foundation::*,
        System::LibraryLoader::GetModuleHandleW,
        UI::WindowsAndMessaging::*,
    },
};

pub struct MessageWindow {
    hwnd: HWND,
}

impl MessageWindow {
    /// The hook lives in the window's user data until the window is dropped.
    pub fn create(hook: EventHook) -> Result<Self> {
        unsafe {
            let instance = GetModuleHandleW(None).context("GetModuleHandleW failed")?;
            let class_name = w!("ClarityLayerEvents");

            let wc = WNDCLASSW {
                lpfnWndProc: Some(window_proc),
                hInstance: instance.into(),
                lpszClassName: class_name,
                ..Default::default()
            };
            RegisterClassW(&wc);

            // Display and power broadcasts only reach top-level windows
            let hwnd = CreateWindowExW(
                WINDOW_EX_STYLE(0),
                class_name,
                w!("Clarity Layer"),
                WS_OVERLAPPED,
                0,
                0,
                0,
                0,
                None,
                None,
                Some(instance.into()),
                None,
            )
            .context("Failed to create message window")?;

            let hook = Box::into_raw(Box::new(hook));
            SetWindowLongPtrW(hwnd, GWLP_USERDATA, hook as isize);
            log_info!("Message window created");
            Ok(Self { hwnd })
        }
    }
}

impl Drop for MessageWindow {
    fn drop(&mut self) {
        unsafe {
            let hook = GetWindowLongPtrW(self.hwnd, GWLP_USERDATA) as *mut EventHook;
            SetWindowLongPtrW(self.hwnd, GWLP_USERDATA, 0);
            if !hook.is_null() {
                drop(Box::from_raw(hook));
            }
            let _ = DestroyWindow(self.hwnd);
        }
    }
}

unsafe fn emit(hwnd: HWND, event: ControlEvent) {
    let hook = GetWindowLongPtrW(hwnd, GWLP_USERDATA) as *const EventHook;
    if let Some(hook) = hook.as_ref() {
        hook.emit(event);
    }
}

unsafe extern "system" fn window_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    match msg {
        WM_DISPLAYCHANGE => {
            emit(hwnd, ControlEvent::DisplayChanged);
            LRESULT(0)
        }
        WM_DPICHANGED => {
            emit(hwnd, ControlEvent::DpiChanged);
            LRESULT(0)
        }
        WM_POWERBROADCAST => {
            if wparam.0 as u32 == PBT_APMRESUMEAUTOMATIC {
                emit(hwnd, ControlEvent::SystemResumed);
            }
            LRESULT(1)
        }
        WM_CLOSE | WM_ENDSESSION => {
            PostQuitMessage(0);
            LRESULT(0)
        }
        _ => DefWindowProcW(hwnd, msg, wparam, lparam),
    }
}
