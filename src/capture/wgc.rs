// Windows.Graphics.Capture backend: one free-threaded frame pool per monitor
use super::{monitor, CaptureBackend, CaptureStream, FrameSink, MonitorDescriptor};
use crate::error::CaptureError;
use crate::gpu::d3d11::{D3d11Device, GpuTexture};
use claritylayer_core::log_warn;
use std::sync::Arc;
use windows::{
    core::{IInspectable, Interface},
    Foundation::TypedEventHandler,
    Graphics::Capture::{
        Direct3D11CaptureFrame, Direct3D11CaptureFramePool, GraphicsCaptureItem,
        GraphicsCaptureSession,
    },
    Graphics::DirectX::{Direct3D11::IDirect3DDevice, DirectXPixelFormat},
    Win32::Graphics::Direct3D11::ID3D11Texture2D,
    Win32::Graphics::Dxgi::IDXGIDevice,
    Win32::System::WinRT::Direct3D11::{
        CreateDirect3D11DeviceFromDXGIDevice, IDirect3DDxgiInterfaceAccess,
    },
    Win32::System::WinRT::Graphics::Capture::IGraphicsCaptureItemInterop,
};

const FRAME_POOL_BUFFERS: i32 = 2;

#[derive(Debug, Default, Clone, Copy)]
pub struct WgcCapture;

impl WgcCapture {
    pub fn new() -> Self {
        Self
    }

    fn open_stream(
        device: &D3d11Device,
        monitor: &MonitorDescriptor,
        sink: FrameSink<GpuTexture>,
    ) -> windows::core::Result<WgcStream> {
        let interop = windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>()?;
        let item: GraphicsCaptureItem =
            unsafe { interop.CreateForMonitor(monitor::to_hmonitor(monitor.handle))? };
        let size = item.Size()?;

        let dxgi_device: IDXGIDevice = device.raw().cast()?;
        let inspectable = unsafe { CreateDirect3D11DeviceFromDXGIDevice(&dxgi_device)? };
        let winrt_device: IDirect3DDevice = inspectable.cast()?;

        let pool = Direct3D11CaptureFramePool::CreateFreeThreaded(
            &winrt_device,
            DirectXPixelFormat::B8G8R8A8UIntNormalized,
            FRAME_POOL_BUFFERS,
            size,
        )?;
        let session = pool.CreateCaptureSession(&item)?;
        let _ = session.SetIsCursorCaptureEnabled(false);
        let _ = session.SetIsBorderRequired(false);

        let token = pool.FrameArrived(&TypedEventHandler::<Direct3D11CaptureFramePool, IInspectable>::new(
            move |sender, _| {
                if let Some(pool) = sender.as_ref() {
                    if let Ok(frame) = pool.TryGetNextFrame() {
                        match frame_texture(&frame) {
                            Ok(texture) => {
                                sink.deliver(Some(&texture));
                            }
                            Err(e) => {
                                tracing::debug!("Dropping frame without texture: {}", e);
                            }
                        }
                        let _ = frame.Close();
                    }
                }
                Ok(())
            },
        ))?;

        session.StartCapture()?;

        let handler_pool = pool.clone();
        Ok(WgcStream {
            remove_handler: Some(Box::new(move || {
                let _ = handler_pool.RemoveFrameArrived(token);
            })),
            session: Some(session),
            pool: Some(pool),
            _item: item,
        })
    }
}

fn frame_texture(frame: &Direct3D11CaptureFrame) -> windows::core::Result<GpuTexture> {
    let surface = frame.Surface()?;
    let access: IDirect3DDxgiInterfaceAccess = surface.cast()?;
    let texture: ID3D11Texture2D = unsafe { access.GetInterface()? };
    Ok(GpuTexture::from_texture(texture))
}

impl CaptureBackend for WgcCapture {
    type Device = D3d11Device;
    type Stream = WgcStream;

    fn is_supported(&self) -> bool {
        match GraphicsCaptureSession::IsSupported() {
            Ok(supported) => supported,
            Err(e) => {
                log_warn!("GraphicsCaptureSession::IsSupported failed: {}", e);
                false
            }
        }
    }

    fn enumerate_monitors(&self) -> Result<Vec<MonitorDescriptor>, CaptureError> {
        monitor::enumerate()
    }

    fn open(
        &self,
        device: &Arc<D3d11Device>,
        monitor: &MonitorDescriptor,
        sink: FrameSink<GpuTexture>,
    ) -> Result<WgcStream, CaptureError> {
        Self::open_stream(device, monitor, sink).map_err(|e| CaptureError::Open {
            monitor: monitor.name.clone(),
            message: e.message().to_string(),
        })
    }
}

pub struct WgcStream {
    remove_handler: Option<Box<dyn FnOnce() + Send>>,
    session: Option<GraphicsCaptureSession>,
    pool: Option<Direct3D11CaptureFramePool>,
    _item: GraphicsCaptureItem,
}

// SAFETY: the WinRT capture objects are agile; the session wrapper only
// touches them from whichever thread runs teardown.
unsafe impl Send for WgcStream {}

impl CaptureStream for WgcStream {
    fn unsubscribe(&mut self) {
        if let Some(remove) = self.remove_handler.take() {
            remove();
        }
    }

    fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.Close();
        }
    }

    fn close_pool(&mut self) {
        if let Some(pool) = self.pool.take() {
            let _ = pool.Close();
        }
    }
}
