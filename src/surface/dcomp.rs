// DirectComposition overlay window with a flip-model swap chain
use super::{PresentStatus, SurfaceBackend, WindowControl};
use crate::capture::Rect;
use crate::error::SurfaceError;
use crate::gpu::d3d11::{D3d11Device, GpuProgram, GpuTexture};
use crate::gpu::{Extent, PassKind, RenderDevice};
use claritylayer_core::{log_info, log_warn};
use std::sync::Arc;
use windows::{
    core::{w, Interface, BOOL, PCWSTR},
    Win32::{
        Foundation::*,
        Graphics::{
            Direct3D11::*,
            DirectComposition::*,
            Dxgi::Common::*,
            Dxgi::*,
        },
        UI::WindowsAndMessaging::*,
    },
};

const BUFFER_COUNT: u32 = 3;

struct OverlayWindow {
    hwnd: isize,
}

impl WindowControl for OverlayWindow {
    fn set_visible(&self, visible: bool) {
        let cmd = if visible { SW_SHOWNOACTIVATE } else { SW_HIDE };
        // Posts to the owning thread; never waits on it
        unsafe {
            let _ = ShowWindowAsync(HWND(self.hwnd as *mut _), cmd);
        }
    }
}

pub struct DCompSurface {
    allow_tearing: bool,
    tearing: bool,
    hwnd: Option<HWND>,
    device: Option<Arc<D3d11Device>>,
    swap_chain: Option<IDXGISwapChain1>,
    dcomp_device: Option<IDCompositionDevice>,
    dcomp_target: Option<IDCompositionTarget>,
    dcomp_visual: Option<IDCompositionVisual>,
    rtv: Option<ID3D11RenderTargetView>,
    blend_state: Option<ID3D11BlendState>,
    copy_program: Option<GpuProgram>,
    extent: Extent,
}

// SAFETY: the surface is only driven from the render path, which is
// serialized by the controller's render lock.
unsafe impl Send for DCompSurface {}

impl DCompSurface {
    pub fn new(allow_tearing: bool) -> Self {
        Self {
            allow_tearing,
            tearing: false,
            hwnd: None,
            device: None,
            swap_chain: None,
            dcomp_device: None,
            dcomp_target: None,
            dcomp_visual: None,
            rtv: None,
            blend_state: None,
            copy_program: None,
            extent: Extent::default(),
        }
    }

    pub fn hwnd(&self) -> Option<HWND> {
        self.hwnd
    }

    unsafe fn tearing_supported(factory: &IDXGIFactory2) -> bool {
        let Ok(factory5) = factory.cast::<IDXGIFactory5>() else {
            return false;
        };
        let mut allow = BOOL::default();
        let result = factory5.CheckFeatureSupport(
            DXGI_FEATURE_PRESENT_ALLOW_TEARING,
            &mut allow as *mut _ as *mut _,
            std::mem::size_of::<BOOL>() as u32,
        );
        result.is_ok() && allow.as_bool()
    }

    fn swap_chain_flags(&self) -> u32 {
        if self.tearing {
            DXGI_SWAP_CHAIN_FLAG_ALLOW_TEARING.0 as u32
        } else {
            0
        }
    }

    unsafe fn create_back_buffer_view(&mut self) -> Result<(), SurfaceError> {
        let device = self.device.as_ref().ok_or(SurfaceError::NotInitialized)?;
        let swap_chain = self.swap_chain.as_ref().ok_or(SurfaceError::NotInitialized)?;

        let back_buffer: ID3D11Texture2D = swap_chain.GetBuffer(0)?;
        let mut rtv: Option<ID3D11RenderTargetView> = None;
        device.raw().CreateRenderTargetView(&back_buffer, None, Some(&mut rtv))?;
        self.rtv = Some(rtv.ok_or_else(|| SurfaceError::SwapChain("no back buffer view".to_string()))?);
        Ok(())
    }

    unsafe fn register_class() -> Result<PCWSTR, SurfaceError> {
        let class_name = w!("ClarityLayerOverlay");
        let hinstance = windows::Win32::System::LibraryLoader::GetModuleHandleW(None)?;

        let wc = WNDCLASSW {
            lpfnWndProc: Some(window_proc),
            hInstance: hinstance.into(),
            lpszClassName: class_name,
            style: CS_HREDRAW | CS_VREDRAW,
            ..Default::default()
        };

        // Re-registration after a restart fails harmlessly
        RegisterClassW(&wc);
        Ok(class_name)
    }
}

unsafe extern "system" fn window_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    match msg {
        WM_NCHITTEST => LRESULT(HTTRANSPARENT as isize),
        WM_MOUSEACTIVATE => LRESULT(MA_NOACTIVATE as isize),
        _ => DefWindowProcW(hwnd, msg, wparam, lparam),
    }
}

fn wrap_err<E: std::fmt::Display>(wrap: fn(String) -> SurfaceError) -> impl Fn(E) -> SurfaceError {
    move |e| wrap(e.to_string())
}

impl SurfaceBackend for DCompSurface {
    type Device = D3d11Device;

    fn virtual_desktop(&self) -> Result<Rect, SurfaceError> {
        let (x, y, w, h) = unsafe {
            (
                GetSystemMetrics(SM_XVIRTUALSCREEN),
                GetSystemMetrics(SM_YVIRTUALSCREEN),
                GetSystemMetrics(SM_CXVIRTUALSCREEN),
                GetSystemMetrics(SM_CYVIRTUALSCREEN),
            )
        };
        let bounds = Rect::new(x, y, x + w, y + h);
        if bounds.is_empty() {
            return Err(SurfaceError::Window("virtual desktop has no area".to_string()));
        }
        Ok(bounds)
    }

    fn create_device(&mut self) -> Result<Arc<D3d11Device>, SurfaceError> {
        let device = D3d11Device::create().map_err(wrap_err(SurfaceError::Device))?;
        let device = Arc::new(device);
        self.device = Some(Arc::clone(&device));
        Ok(device)
    }

    fn create_window(&mut self, bounds: Rect) -> Result<Arc<dyn WindowControl>, SurfaceError> {
        unsafe {
            let class_name = Self::register_class()?;
            let hinstance = windows::Win32::System::LibraryLoader::GetModuleHandleW(None)?;

            let hwnd = CreateWindowExW(
                WS_EX_LAYERED | WS_EX_TRANSPARENT | WS_EX_TOPMOST | WS_EX_TOOLWINDOW | WS_EX_NOACTIVATE,
                class_name,
                w!("Clarity Layer Overlay"),
                WS_POPUP,
                bounds.left,
                bounds.top,
                bounds.width(),
                bounds.height(),
                None,
                None,
                Some(HINSTANCE(hinstance.0)),
                None,
            )
            .map_err(wrap_err(SurfaceError::Window))?;

            // The overlay must never feed back into its own capture
            if let Err(e) = SetWindowDisplayAffinity(hwnd, WDA_EXCLUDEFROMCAPTURE) {
                log_warn!("Failed to exclude overlay from capture: {:?}", e);
            }

            self.hwnd = Some(hwnd);
            log_info!("Overlay window created");
            Ok(Arc::new(OverlayWindow { hwnd: hwnd.0 as isize }))
        }
    }

    fn create_swap_chain(&mut self, device: &Arc<D3d11Device>, bounds: Rect) -> Result<(), SurfaceError> {
        let hwnd = self.hwnd.ok_or(SurfaceError::NotInitialized)?;
        let extent = Extent::new(bounds.width() as u32, bounds.height() as u32);

        unsafe {
            let dxgi_device = device.raw().cast::<IDXGIDevice>()?;
            let dxgi_adapter = dxgi_device.GetAdapter()?;
            let dxgi_factory: IDXGIFactory2 = dxgi_adapter.GetParent()?;

            self.tearing = self.allow_tearing && Self::tearing_supported(&dxgi_factory);

            let swap_chain_desc = DXGI_SWAP_CHAIN_DESC1 {
                Width: extent.width,
                Height: extent.height,
                Format: DXGI_FORMAT_B8G8R8A8_UNORM,
                SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                BufferCount: BUFFER_COUNT,
                SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
                AlphaMode: DXGI_ALPHA_MODE_PREMULTIPLIED,
                Flags: self.swap_chain_flags(),
                ..Default::default()
            };

            let swap_chain = dxgi_factory
                .CreateSwapChainForComposition(device.raw(), &swap_chain_desc, None)
                .map_err(wrap_err(SurfaceError::SwapChain))?;

            let dcomp_device: IDCompositionDevice = DCompositionCreateDevice(&dxgi_device)?;
            let dcomp_target = dcomp_device.CreateTargetForHwnd(hwnd, true)?;
            let dcomp_visual = dcomp_device.CreateVisual()?;
            dcomp_visual.SetContent(&swap_chain)?;
            dcomp_target.SetRoot(&dcomp_visual)?;
            dcomp_device.Commit()?;

            self.swap_chain = Some(swap_chain);
            self.dcomp_device = Some(dcomp_device);
            self.dcomp_target = Some(dcomp_target);
            self.dcomp_visual = Some(dcomp_visual);
            self.extent = extent;
            self.create_back_buffer_view()?;
        }

        log_info!("Swap chain created: {} buffers, {}, tearing {}", BUFFER_COUNT, extent, self.tearing);
        Ok(())
    }

    fn create_geometry(&mut self, device: &Arc<D3d11Device>) -> Result<(), SurfaceError> {
        let blend_desc = D3D11_BLEND_DESC {
            AlphaToCoverageEnable: false.into(),
            IndependentBlendEnable: false.into(),
            RenderTarget: [
                D3D11_RENDER_TARGET_BLEND_DESC {
                    BlendEnable: true.into(),
                    SrcBlend: D3D11_BLEND_ONE,
                    DestBlend: D3D11_BLEND_INV_SRC_ALPHA,
                    BlendOp: D3D11_BLEND_OP_ADD,
                    SrcBlendAlpha: D3D11_BLEND_ONE,
                    DestBlendAlpha: D3D11_BLEND_INV_SRC_ALPHA,
                    BlendOpAlpha: D3D11_BLEND_OP_ADD,
                    RenderTargetWriteMask: D3D11_COLOR_WRITE_ENABLE_ALL.0 as u8,
                },
                Default::default(),
                Default::default(),
                Default::default(),
                Default::default(),
                Default::default(),
                Default::default(),
                Default::default(),
            ],
        };

        unsafe {
            let mut blend_state: Option<ID3D11BlendState> = None;
            device.raw().CreateBlendState(&blend_desc, Some(&mut blend_state))?;
            self.blend_state = blend_state;
        }

        let program = device.compile_program(PassKind::Passthrough, PassKind::Passthrough.builtin_source())?;
        self.copy_program = Some(program);
        Ok(())
    }

    fn draw(&mut self, device: &D3d11Device, texture: &GpuTexture) -> Result<(), SurfaceError> {
        let rtv = self.rtv.clone().ok_or(SurfaceError::NotInitialized)?;
        let blend = self.blend_state.clone().ok_or(SurfaceError::NotInitialized)?;
        let program = self.copy_program.as_ref().ok_or(SurfaceError::NotInitialized)?;
        let srv = device.shader_view(texture)?;
        let extent = self.extent;

        device.with_context(|ctx| unsafe {
            let clear_color = [0.0f32, 0.0, 0.0, 0.0];
            ctx.ClearRenderTargetView(&rtv, &clear_color);
            ctx.OMSetRenderTargets(Some(&[Some(rtv.clone())]), None);

            let blend_factor = [1.0f32, 1.0, 1.0, 1.0];
            ctx.OMSetBlendState(Some(&blend), Some(&blend_factor), 0xffffffff);

            device.bind_fullscreen(ctx, extent);
            ctx.PSSetShader(program.shader(), None);
            ctx.PSSetShaderResources(0, Some(&[Some(srv)]));
            ctx.Draw(6, 0);
            ctx.PSSetShaderResources(0, Some(&[None]));
        });
        Ok(())
    }

    fn present(&mut self) -> PresentStatus {
        let Some(swap_chain) = self.swap_chain.as_ref() else {
            return PresentStatus::Failed("no swap chain".to_string());
        };

        let flags = if self.tearing {
            DXGI_PRESENT_ALLOW_TEARING
        } else {
            DXGI_PRESENT(0)
        };

        // Sync interval 0: no vsync wait
        let hr = unsafe { swap_chain.Present(0, flags) };
        if hr == DXGI_ERROR_DEVICE_REMOVED {
            let reason = self.device.as_ref().and_then(|d| d.removed_reason());
            return PresentStatus::DeviceRemoved(reason);
        }
        if hr == DXGI_ERROR_DEVICE_RESET {
            return PresentStatus::DeviceReset;
        }
        if hr.is_err() {
            return PresentStatus::Failed(format!("IDXGISwapChain::Present returned 0x{:08x}", hr.0));
        }

        if let Some(dcomp) = &self.dcomp_device {
            unsafe {
                let _ = dcomp.Commit();
            }
        }
        PresentStatus::Presented
    }

    fn reposition(&mut self, bounds: Rect) -> Result<(), SurfaceError> {
        let hwnd = self.hwnd.ok_or(SurfaceError::NotInitialized)?;
        unsafe {
            SetWindowPos(
                hwnd,
                Some(HWND_TOPMOST),
                bounds.left,
                bounds.top,
                bounds.width(),
                bounds.height(),
                SWP_NOACTIVATE,
            )
            .map_err(wrap_err(SurfaceError::Window))
        }
    }

    fn resize_buffers(&mut self, bounds: Rect) -> Result<(), SurfaceError> {
        let extent = Extent::new(bounds.width() as u32, bounds.height() as u32);
        if extent.is_empty() {
            return Err(SurfaceError::Resize(format!("cannot resize to {}", extent)));
        }
        let flags = self.swap_chain_flags();
        let swap_chain = self.swap_chain.clone().ok_or(SurfaceError::NotInitialized)?;

        // Every reference to the old back buffers has to go first
        self.rtv = None;
        if let Some(device) = &self.device {
            device.with_context(|ctx| unsafe {
                ctx.OMSetRenderTargets(None, None);
                ctx.Flush();
            });
        }

        unsafe {
            swap_chain
                .ResizeBuffers(
                    BUFFER_COUNT,
                    extent.width,
                    extent.height,
                    DXGI_FORMAT_B8G8R8A8_UNORM,
                    DXGI_SWAP_CHAIN_FLAG(flags as i32),
                )
                .map_err(wrap_err(SurfaceError::Resize))?;
            self.extent = extent;
            self.create_back_buffer_view()?;
        }
        Ok(())
    }

    fn release_device_resources(&mut self) {
        if let Some(device) = &self.device {
            device.with_context(|ctx| unsafe {
                ctx.ClearState();
                ctx.Flush();
            });
        }
        self.rtv = None;
        self.copy_program = None;
        self.blend_state = None;
        self.dcomp_visual = None;
        self.dcomp_target = None;
        self.dcomp_device = None;
        self.swap_chain = None;
        self.device = None;
    }
}

impl Drop for DCompSurface {
    fn drop(&mut self) {
        self.release_device_resources();
        if let Some(hwnd) = self.hwnd.take() {
            unsafe {
                let _ = DestroyWindow(hwnd);
            }
        }
    }
}
