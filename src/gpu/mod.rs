// Render-device abstraction shared by capture, transform and presentation
pub mod software;

#[cfg(windows)]
pub mod d3d11;

use crate::error::GpuError;
use claritylayer_core::{log_info, log_warn, TransformParameters};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Full-screen pixel passes understood by every render device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    Adjust,
    Invert,
    EdgeEnhance,
    Passthrough,
}

impl PassKind {
    pub const ALL: [PassKind; 4] = [
        PassKind::Adjust,
        PassKind::Invert,
        PassKind::EdgeEnhance,
        PassKind::Passthrough,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PassKind::Adjust => "adjust",
            PassKind::Invert => "invert",
            PassKind::EdgeEnhance => "edge_enhance",
            PassKind::Passthrough => "passthrough",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.hlsl", self.name())
    }

    /// Passes without which the pipeline cannot produce output.
    pub fn is_required(self) -> bool {
        !matches!(self, PassKind::EdgeEnhance)
    }

    pub(crate) fn builtin_source(self) -> &'static str {
        match self {
            PassKind::Adjust => include_str!("../../shaders/adjust.hlsl"),
            PassKind::Invert => include_str!("../../shaders/invert.hlsl"),
            PassKind::EdgeEnhance => include_str!("../../shaders/edge_enhance.hlsl"),
            PassKind::Passthrough => include_str!("../../shaders/passthrough.hlsl"),
        }
    }
}

/// Vertex stage shared by every full-screen pass.
pub const FULLSCREEN_VS: &str = include_str!("../../shaders/fullscreen_vs.hlsl");

/// Constant-buffer layout consumed by the pixel passes (register b0).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ParamBlock {
    pub contrast: f32,
    pub brightness: f32,
    pub gamma: f32,
    pub saturation: f32,
    pub invert_mode: i32,
    pub edge_strength: f32,
    pub texel_size: [f32; 2],
}

impl ParamBlock {
    pub fn new(params: &TransformParameters, extent: Extent) -> Self {
        let params = params.clamped();
        let texel = |v: u32| if v == 0 { 0.0 } else { 1.0 / v as f32 };
        Self {
            contrast: params.contrast,
            brightness: params.brightness,
            gamma: params.gamma,
            saturation: params.saturation,
            invert_mode: params.invert_mode.as_index(),
            edge_strength: params.edge_strength,
            texel_size: [texel(extent.width), texel(extent.height)],
        }
    }
}

/// A GPU (or GPU-like) device able to run the full-screen passes.
///
/// All methods take `&self`; implementations serialize access to their
/// immediate context internally. Callers are still expected to drive a device
/// from one logical render thread at a time.
pub trait RenderDevice: Send + Sync + 'static {
    type Texture: Clone + Send + Sync + 'static;
    type Program: Send + Sync + 'static;
    type Uniforms: Send + Sync + 'static;

    fn texture_extent(&self, texture: &Self::Texture) -> Extent;

    /// Allocates a texture usable both as a render target and a shader input.
    fn create_target(&self, extent: Extent) -> Result<Self::Texture, GpuError>;

    fn compile_program(&self, pass: PassKind, source: &str) -> Result<Self::Program, GpuError>;

    fn create_uniforms(&self) -> Result<Self::Uniforms, GpuError>;

    fn write_uniforms(&self, uniforms: &Self::Uniforms, block: &ParamBlock) -> Result<(), GpuError>;

    /// Draws one full-screen pass reading `input` and writing `target`.
    fn draw_pass(
        &self,
        program: &Self::Program,
        uniforms: &Self::Uniforms,
        input: &Self::Texture,
        target: &Self::Texture,
    ) -> Result<(), GpuError>;
}

/// Owner side of the shared device. Only the presentation surface holds one.
pub struct DeviceSlot<D> {
    inner: Arc<RwLock<Option<Arc<D>>>>,
}

impl<D> DeviceSlot<D> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    pub fn publish(&self, device: Arc<D>) {
        *self.inner.write() = Some(device);
    }

    pub fn revoke(&self) -> Option<Arc<D>> {
        self.inner.write().take()
    }

    pub fn current(&self) -> Option<Arc<D>> {
        self.inner.read().clone()
    }

    pub fn handle(&self) -> DeviceHandle<D> {
        DeviceHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D> Default for DeviceSlot<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-owning, read-only capability to whatever device is currently published.
pub struct DeviceHandle<D> {
    inner: Arc<RwLock<Option<Arc<D>>>>,
}

impl<D> Clone for DeviceHandle<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D> DeviceHandle<D> {
    pub fn current(&self) -> Option<Arc<D>> {
        self.inner.read().clone()
    }

    pub fn require(&self) -> Result<Arc<D>, GpuError> {
        self.current().ok_or(GpuError::NoDevice)
    }
}

/// HLSL sources for the pixel passes.
#[derive(Debug, Clone, Default)]
pub struct ShaderAssets {
    sources: HashMap<PassKind, String>,
}

impl ShaderAssets {
    pub fn builtin() -> Self {
        let sources = PassKind::ALL
            .iter()
            .map(|kind| (*kind, kind.builtin_source().to_string()))
            .collect();
        Self { sources }
    }

    /// Reads `<pass>.hlsl` files from `dir`. Missing files are left absent.
    pub fn load_dir(dir: &Path) -> Self {
        let mut sources = HashMap::new();
        for kind in PassKind::ALL {
            let path = dir.join(kind.file_name());
            match std::fs::read_to_string(&path) {
                Ok(source) => {
                    sources.insert(kind, source);
                }
                Err(e) => {
                    log_warn!("Shader asset {} not loaded: {}", path.display(), e);
                }
            }
        }
        log_info!("Loaded {} shader assets from {}", sources.len(), dir.display());
        Self { sources }
    }

    /// Fills any missing required pass with its built-in source.
    pub fn with_builtin_fallback(mut self) -> Self {
        for kind in PassKind::ALL.into_iter().filter(|k| k.is_required()) {
            self.sources
                .entry(kind)
                .or_insert_with(|| kind.builtin_source().to_string());
        }
        self
    }

    pub fn without(mut self, kind: PassKind) -> Self {
        self.sources.remove(&kind);
        self
    }

    pub fn with_source(mut self, kind: PassKind, source: impl Into<String>) -> Self {
        self.sources.insert(kind, source.into());
        self
    }

    pub fn source(&self, kind: PassKind) -> Option<&str> {
        self.sources.get(&kind).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_block_layout_is_constant_buffer_aligned() {
        assert_eq!(std::mem::size_of::<ParamBlock>() % 16, 0);
    }

    #[test]
    fn test_param_block_clamps_and_computes_texel_size() {
        let params = TransformParameters {
            contrast: 7.0,
            ..TransformParameters::default()
        };
        let block = ParamBlock::new(&params, Extent::new(4, 2));
        assert_eq!(block.contrast, 4.0);
        assert_eq!(block.texel_size, [0.25, 0.5]);
        assert_eq!(block.invert_mode, 0);
    }

    #[test]
    fn test_builtin_fallback_never_restores_edge_pass() {
        let assets = ShaderAssets::default().with_builtin_fallback();
        assert!(assets.source(PassKind::Adjust).is_some());
        assert!(assets.source(PassKind::Passthrough).is_some());
        assert!(assets.source(PassKind::EdgeEnhance).is_none());
    }

    #[test]
    fn test_device_handle_tracks_republished_device() {
        let slot: DeviceSlot<u32> = DeviceSlot::new();
        let handle = slot.handle();
        assert!(handle.require().is_err());

        slot.publish(Arc::new(1));
        assert_eq!(handle.current().as_deref(), Some(&1));

        slot.revoke();
        slot.publish(Arc::new(2));
        assert_eq!(handle.current().as_deref(), Some(&2));
    }
}
