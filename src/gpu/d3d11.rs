// Direct3D 11 render device: full-screen passes over BGRA textures
use super::{Extent, ParamBlock, PassKind, RenderDevice, FULLSCREEN_VS};
use crate::error::GpuError;
use claritylayer_core::log_info;
use parking_lot::Mutex;
use windows::core::{s, PCSTR};
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::Fxc::{D3DCompile, D3DCOMPILE_ENABLE_STRICTNESS};
use windows::Win32::Graphics::Direct3D::{
    ID3DBlob, D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL, D3D_FEATURE_LEVEL_10_1,
    D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_11_1, D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;

/// A texture plus the views needed to read it and, for owned targets, draw into it.
#[derive(Clone)]
pub struct GpuTexture {
    texture: ID3D11Texture2D,
    srv: Option<ID3D11ShaderResourceView>,
    rtv: Option<ID3D11RenderTargetView>,
}

// SAFETY: D3D11 resources are free-threaded; every context call goes through
// the owning device's context lock.
unsafe impl Send for GpuTexture {}
unsafe impl Sync for GpuTexture {}

impl GpuTexture {
    /// Wraps an externally produced texture such as a captured frame.
    pub fn from_texture(texture: ID3D11Texture2D) -> Self {
        Self {
            texture,
            srv: None,
            rtv: None,
        }
    }

    pub fn raw(&self) -> &ID3D11Texture2D {
        &self.texture
    }
}

pub struct GpuProgram {
    shader: ID3D11PixelShader,
}

impl GpuProgram {
    pub(crate) fn shader(&self) -> &ID3D11PixelShader {
        &self.shader
    }
}

unsafe impl Send for GpuProgram {}
unsafe impl Sync for GpuProgram {}

pub struct GpuUniforms {
    buffer: ID3D11Buffer,
}

unsafe impl Send for GpuUniforms {}
unsafe impl Sync for GpuUniforms {}

#[repr(C)]
struct Vertex {
    pos: [f32; 2],
    tex: [f32; 2],
}

pub struct D3d11Device {
    device: ID3D11Device,
    context: Mutex<ID3D11DeviceContext>,
    vertex_shader: ID3D11VertexShader,
    input_layout: ID3D11InputLayout,
    quad: ID3D11Buffer,
    sampler: ID3D11SamplerState,
    feature_level: D3D_FEATURE_LEVEL,
}

// SAFETY: ID3D11Device is free-threaded and the immediate context is only
// reached through the mutex above.
unsafe impl Send for D3d11Device {}
unsafe impl Sync for D3d11Device {}

impl D3d11Device {
    pub fn create() -> Result<Self, GpuError> {
        unsafe {
            let mut device: Option<ID3D11Device> = None;
            let mut context: Option<ID3D11DeviceContext> = None;
            let mut feature_level = D3D_FEATURE_LEVEL::default();

            let feature_levels = [
                D3D_FEATURE_LEVEL_11_1,
                D3D_FEATURE_LEVEL_11_0,
                D3D_FEATURE_LEVEL_10_1,
            ];

            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                Some(&feature_levels),
                D3D11_SDK_VERSION,
                Some(&mut device),
                Some(&mut feature_level),
                Some(&mut context),
            )?;

            let device = device.ok_or_else(|| GpuError::Resource("D3D11CreateDevice returned no device".into()))?;
            let context = context.ok_or_else(|| GpuError::Resource("D3D11CreateDevice returned no context".into()))?;

            let (vertex_shader, input_layout) = Self::create_vertex_stage(&device)?;
            let quad = Self::create_quad(&device)?;
            let sampler = Self::create_sampler(&device)?;

            log_info!("D3D11 device created (feature level 0x{:x})", feature_level.0);

            Ok(Self {
                device,
                context: Mutex::new(context),
                vertex_shader,
                input_layout,
                quad,
                sampler,
                feature_level,
            })
        }
    }

    pub fn raw(&self) -> &ID3D11Device {
        &self.device
    }

    pub fn feature_level(&self) -> D3D_FEATURE_LEVEL {
        self.feature_level
    }

    /// Runs `f` with exclusive access to the immediate context.
    pub fn with_context<R>(&self, f: impl FnOnce(&ID3D11DeviceContext) -> R) -> R {
        let context = self.context.lock();
        f(&context)
    }

    /// Reason reported by the driver after a device-removed present, if any.
    pub fn removed_reason(&self) -> Option<String> {
        unsafe {
            match self.device.GetDeviceRemovedReason() {
                Ok(()) => None,
                Err(e) => Some(format!("{} (0x{:08x})", e.message(), e.code().0)),
            }
        }
    }

    /// Binds the shared quad, vertex stage and sampler for a full-screen draw.
    pub(crate) fn bind_fullscreen(&self, ctx: &ID3D11DeviceContext, extent: Extent) {
        unsafe {
            let viewport = D3D11_VIEWPORT {
                TopLeftX: 0.0,
                TopLeftY: 0.0,
                Width: extent.width as f32,
                Height: extent.height as f32,
                MinDepth: 0.0,
                MaxDepth: 1.0,
            };
            ctx.RSSetViewports(Some(&[viewport]));

            ctx.VSSetShader(&self.vertex_shader, None);
            ctx.IASetInputLayout(&self.input_layout);
            ctx.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);

            let stride = std::mem::size_of::<Vertex>() as u32;
            let offset = 0u32;
            ctx.IASetVertexBuffers(0, 1, Some(&Some(self.quad.clone())), Some(&stride), Some(&offset));
            ctx.PSSetSamplers(0, Some(&[Some(self.sampler.clone())]));
        }
    }

    pub(crate) fn shader_view(&self, texture: &GpuTexture) -> Result<ID3D11ShaderResourceView, GpuError> {
        if let Some(srv) = &texture.srv {
            return Ok(srv.clone());
        }
        unsafe {
            let mut srv: Option<ID3D11ShaderResourceView> = None;
            self.device.CreateShaderResourceView(&texture.texture, None, Some(&mut srv))?;
            srv.ok_or_else(|| GpuError::Resource("CreateShaderResourceView returned no view".into()))
        }
    }

    pub(crate) fn compile_blob(source: &str, entry_point: PCSTR, target: PCSTR, pass: &'static str) -> Result<ID3DBlob, GpuError> {
        unsafe {
            let mut blob: Option<ID3DBlob> = None;
            let mut error_blob: Option<ID3DBlob> = None;

            let result = D3DCompile(
                source.as_ptr() as *const _,
                source.len(),
                None,
                None,
                None,
                entry_point,
                target,
                D3DCOMPILE_ENABLE_STRICTNESS,
                0,
                &mut blob,
                Some(&mut error_blob),
            );

            if let Err(e) = result {
                let message = match error_blob {
                    Some(error_blob) => {
                        let bytes = std::slice::from_raw_parts(
                            error_blob.GetBufferPointer() as *const u8,
                            error_blob.GetBufferSize(),
                        );
                        String::from_utf8_lossy(bytes).into_owned()
                    }
                    None => e.message().to_string(),
                };
                return Err(GpuError::ShaderCompile { pass, message });
            }

            blob.ok_or_else(|| GpuError::ShaderCompile {
                pass,
                message: "compiler produced no bytecode".to_string(),
            })
        }
    }

    fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
        unsafe { std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()) }
    }

    fn create_vertex_stage(device: &ID3D11Device) -> Result<(ID3D11VertexShader, ID3D11InputLayout), GpuError> {
        let vs_blob = Self::compile_blob(FULLSCREEN_VS, s!("VSMain"), s!("vs_5_0"), "fullscreen_vs")?;
        let bytecode = Self::blob_bytes(&vs_blob);

        unsafe {
            let mut vertex_shader: Option<ID3D11VertexShader> = None;
            device.CreateVertexShader(bytecode, None, Some(&mut vertex_shader))?;

            let input_elements = [
                D3D11_INPUT_ELEMENT_DESC {
                    SemanticName: s!("POSITION"),
                    SemanticIndex: 0,
                    Format: DXGI_FORMAT_R32G32_FLOAT,
                    InputSlot: 0,
                    AlignedByteOffset: 0,
                    InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                    InstanceDataStepRate: 0,
                },
                D3D11_INPUT_ELEMENT_DESC {
                    SemanticName: s!("TEXCOORD"),
                    SemanticIndex: 0,
                    Format: DXGI_FORMAT_R32G32_FLOAT,
                    InputSlot: 0,
                    AlignedByteOffset: 8,
                    InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                    InstanceDataStepRate: 0,
                },
            ];

            let mut input_layout: Option<ID3D11InputLayout> = None;
            device.CreateInputLayout(&input_elements, bytecode, Some(&mut input_layout))?;

            let vertex_shader = vertex_shader.ok_or_else(|| GpuError::Resource("no vertex shader".into()))?;
            let input_layout = input_layout.ok_or_else(|| GpuError::Resource("no input layout".into()))?;
            Ok((vertex_shader, input_layout))
        }
    }

    fn create_quad(device: &ID3D11Device) -> Result<ID3D11Buffer, GpuError> {
        let vertices = [
            Vertex { pos: [-1.0, 1.0], tex: [0.0, 0.0] },
            Vertex { pos: [1.0, 1.0], tex: [1.0, 0.0] },
            Vertex { pos: [-1.0, -1.0], tex: [0.0, 1.0] },
            Vertex { pos: [1.0, 1.0], tex: [1.0, 0.0] },
            Vertex { pos: [1.0, -1.0], tex: [1.0, 1.0] },
            Vertex { pos: [-1.0, -1.0], tex: [0.0, 1.0] },
        ];

        let vertex_data = D3D11_SUBRESOURCE_DATA {
            pSysMem: vertices.as_ptr() as *const _,
            SysMemPitch: 0,
            SysMemSlicePitch: 0,
        };

        let buffer_desc = D3D11_BUFFER_DESC {
            ByteWidth: std::mem::size_of_val(&vertices) as u32,
            Usage: D3D11_USAGE_IMMUTABLE,
            BindFlags: D3D11_BIND_VERTEX_BUFFER.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
            StructureByteStride: 0,
        };

        unsafe {
            let mut vertex_buffer: Option<ID3D11Buffer> = None;
            device.CreateBuffer(&buffer_desc, Some(&vertex_data), Some(&mut vertex_buffer))?;
            vertex_buffer.ok_or_else(|| GpuError::Resource("no vertex buffer".into()))
        }
    }

    fn create_sampler(device: &ID3D11Device) -> Result<ID3D11SamplerState, GpuError> {
        let sampler_desc = D3D11_SAMPLER_DESC {
            Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
            AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
            MipLODBias: 0.0,
            MaxAnisotropy: 1,
            ComparisonFunc: D3D11_COMPARISON_NEVER,
            BorderColor: [0.0, 0.0, 0.0, 0.0],
            MinLOD: 0.0,
            MaxLOD: f32::MAX,
        };

        unsafe {
            let mut sampler: Option<ID3D11SamplerState> = None;
            device.CreateSamplerState(&sampler_desc, Some(&mut sampler))?;
            sampler.ok_or_else(|| GpuError::Resource("no sampler state".into()))
        }
    }
}

impl RenderDevice for D3d11Device {
    type Texture = GpuTexture;
    type Program = GpuProgram;
    type Uniforms = GpuUniforms;

    fn texture_extent(&self, texture: &GpuTexture) -> Extent {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.texture.GetDesc(&mut desc) };
        Extent::new(desc.Width, desc.Height)
    }

    fn create_target(&self, extent: Extent) -> Result<GpuTexture, GpuError> {
        if extent.is_empty() {
            return Err(GpuError::Resource(format!("cannot allocate {} target", extent)));
        }

        let desc = D3D11_TEXTURE2D_DESC {
            Width: extent.width,
            Height: extent.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_SHADER_RESOURCE.0 | D3D11_BIND_RENDER_TARGET.0) as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };

        unsafe {
            let mut texture: Option<ID3D11Texture2D> = None;
            self.device.CreateTexture2D(&desc, None, Some(&mut texture))?;
            let texture = texture.ok_or_else(|| GpuError::Resource("no texture".into()))?;

            let mut srv: Option<ID3D11ShaderResourceView> = None;
            self.device.CreateShaderResourceView(&texture, None, Some(&mut srv))?;

            let mut rtv: Option<ID3D11RenderTargetView> = None;
            self.device.CreateRenderTargetView(&texture, None, Some(&mut rtv))?;

            Ok(GpuTexture {
                texture,
                srv,
                rtv,
            })
        }
    }

    fn compile_program(&self, pass: PassKind, source: &str) -> Result<GpuProgram, GpuError> {
        let blob = Self::compile_blob(source, s!("PSMain"), s!("ps_5_0"), pass.name())?;
        unsafe {
            let mut shader: Option<ID3D11PixelShader> = None;
            self.device.CreatePixelShader(Self::blob_bytes(&blob), None, Some(&mut shader))?;
            let shader = shader.ok_or_else(|| GpuError::Resource(format!("no pixel shader for {}", pass.name())))?;
            Ok(GpuProgram { shader })
        }
    }

    fn create_uniforms(&self) -> Result<GpuUniforms, GpuError> {
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: std::mem::size_of::<ParamBlock>() as u32,
            Usage: D3D11_USAGE_DYNAMIC,
            BindFlags: D3D11_BIND_CONSTANT_BUFFER.0 as u32,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            MiscFlags: 0,
            StructureByteStride: 0,
        };

        unsafe {
            let mut buffer: Option<ID3D11Buffer> = None;
            self.device.CreateBuffer(&desc, None, Some(&mut buffer))?;
            let buffer = buffer.ok_or_else(|| GpuError::Resource("no constant buffer".into()))?;
            Ok(GpuUniforms { buffer })
        }
    }

    fn write_uniforms(&self, uniforms: &GpuUniforms, block: &ParamBlock) -> Result<(), GpuError> {
        self.with_context(|ctx| unsafe {
            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            ctx.Map(&uniforms.buffer, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped))?;
            std::ptr::copy_nonoverlapping(block as *const ParamBlock, mapped.pData as *mut ParamBlock, 1);
            ctx.Unmap(&uniforms.buffer, 0);
            Ok(())
        })
    }

    fn draw_pass(
        &self,
        program: &GpuProgram,
        uniforms: &GpuUniforms,
        input: &GpuTexture,
        target: &GpuTexture,
    ) -> Result<(), GpuError> {
        let srv = self.shader_view(input)?;
        let rtv = target
            .rtv
            .clone()
            .ok_or_else(|| GpuError::Resource("pass target has no render target view".into()))?;
        let extent = self.texture_extent(target);

        self.with_context(|ctx| unsafe {
            ctx.OMSetRenderTargets(Some(&[Some(rtv)]), None);
            ctx.OMSetBlendState(None::<&ID3D11BlendState>, None, 0xffffffff);
            self.bind_fullscreen(ctx, extent);

            ctx.PSSetShader(&program.shader, None);
            ctx.PSSetShaderResources(0, Some(&[Some(srv)]));
            ctx.PSSetConstantBuffers(0, Some(&[Some(uniforms.buffer.clone())]));
            ctx.Draw(6, 0);

            // Unbind so the next pass can render into this texture
            ctx.PSSetShaderResources(0, Some(&[None]));
            ctx.OMSetRenderTargets(None, None);
        });

        Ok(())
    }
}
