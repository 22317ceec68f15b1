// CPU rendition of the pass shaders. Used for headless runs and as the
// reference the GPU passes are checked against.
use super::{Extent, ParamBlock, PassKind, RenderDevice};
use crate::error::GpuError;
use image::{Rgba, Rgba32FImage};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const LUMA: [f32; 3] = [0.2126, 0.7152, 0.0722];

/// Shared RGBA32F image; cloning shares the pixels like a COM reference would.
#[derive(Clone)]
pub struct SoftTexture {
    image: Arc<RwLock<Rgba32FImage>>,
}

impl SoftTexture {
    pub fn from_image(image: Rgba32FImage) -> Self {
        Self {
            image: Arc::new(RwLock::new(image)),
        }
    }

    pub fn filled(extent: Extent, rgba: [f32; 4]) -> Self {
        Self::from_image(Rgba32FImage::from_pixel(extent.width, extent.height, Rgba(rgba)))
    }

    pub fn extent(&self) -> Extent {
        let (width, height) = self.image.read().dimensions();
        Extent::new(width, height)
    }

    pub fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        self.image.read().get_pixel(x, y).0
    }

    pub fn snapshot(&self) -> Rgba32FImage {
        self.image.read().clone()
    }

    pub fn same_texture(&self, other: &SoftTexture) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }

    /// Number of live handles to these pixels.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.image)
    }
}

pub struct SoftProgram {
    pass: PassKind,
}

pub struct SoftUniforms {
    block: Mutex<ParamBlock>,
}

/// Render device that executes every pass on the CPU.
#[derive(Default)]
pub struct SoftwareDevice {
    uploads: AtomicUsize,
    allocations: AtomicUsize,
    draws: AtomicUsize,
    upload_fault: AtomicBool,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::Acquire)
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Acquire)
    }

    pub fn draw_count(&self) -> usize {
        self.draws.load(Ordering::Acquire)
    }

    /// Makes every parameter upload fail until cleared.
    pub fn fail_uploads(&self, fail: bool) {
        self.upload_fault.store(fail, Ordering::Release);
    }
}

impl RenderDevice for SoftwareDevice {
    type Texture = SoftTexture;
    type Program = SoftProgram;
    type Uniforms = SoftUniforms;

    fn texture_extent(&self, texture: &SoftTexture) -> Extent {
        texture.extent()
    }

    fn create_target(&self, extent: Extent) -> Result<SoftTexture, GpuError> {
        if extent.is_empty() {
            return Err(GpuError::Resource(format!("cannot allocate {} target", extent)));
        }
        self.allocations.fetch_add(1, Ordering::AcqRel);
        Ok(SoftTexture::filled(extent, [0.0; 4]))
    }

    fn compile_program(&self, pass: PassKind, source: &str) -> Result<SoftProgram, GpuError> {
        if !source.contains("PSMain") {
            return Err(GpuError::ShaderCompile {
                pass: pass.name(),
                message: "entry point PSMain not found".to_string(),
            });
        }
        Ok(SoftProgram { pass })
    }

    fn create_uniforms(&self) -> Result<SoftUniforms, GpuError> {
        Ok(SoftUniforms {
            block: Mutex::new(ParamBlock::default()),
        })
    }

    fn write_uniforms(&self, uniforms: &SoftUniforms, block: &ParamBlock) -> Result<(), GpuError> {
        if self.upload_fault.load(Ordering::Acquire) {
            return Err(GpuError::Resource("parameter buffer upload failed".to_string()));
        }
        *uniforms.block.lock() = *block;
        self.uploads.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn draw_pass(
        &self,
        program: &SoftProgram,
        uniforms: &SoftUniforms,
        input: &SoftTexture,
        target: &SoftTexture,
    ) -> Result<(), GpuError> {
        if input.same_texture(target) {
            return Err(GpuError::Resource(format!(
                "{} pass would read and write the same texture",
                program.pass.name()
            )));
        }

        let block = *uniforms.block.lock();
        let src = input.image.read();
        let mut dst = target.image.write();
        if src.dimensions() != dst.dimensions() {
            return Err(GpuError::Extent(format!(
                "{:?} into {:?}",
                src.dimensions(),
                dst.dimensions()
            )));
        }

        let (width, height) = src.dimensions();
        for (x, y, out) in dst.enumerate_pixels_mut() {
            let px = src.get_pixel(x, y).0;
            out.0 = match program.pass {
                PassKind::Adjust => adjust(px, &block),
                PassKind::Invert => invert(px, block.invert_mode),
                PassKind::Passthrough => px,
                PassKind::EdgeEnhance => {
                    let at = |dx: i64, dy: i64| {
                        let nx = (x as i64 + dx).clamp(0, width as i64 - 1) as u32;
                        let ny = (y as i64 + dy).clamp(0, height as i64 - 1) as u32;
                        src.get_pixel(nx, ny).0
                    };
                    edge_enhance(px, [at(0, -1), at(0, 1), at(1, 0), at(-1, 0)], block.edge_strength)
                }
            };
        }

        self.draws.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

fn luma(c: [f32; 3]) -> f32 {
    c[0] * LUMA[0] + c[1] * LUMA[1] + c[2] * LUMA[2]
}

/// Combination pass: contrast and brightness, then gamma, then saturation.
pub fn adjust(px: [f32; 4], p: &ParamBlock) -> [f32; 4] {
    let mut c = [0.0f32; 3];
    for i in 0..3 {
        let v = ((px[i] - 0.5) * p.contrast + 0.5 + p.brightness).clamp(0.0, 1.0);
        c[i] = v.powf(1.0 / p.gamma);
    }

    let l = luma(c);
    for v in c.iter_mut() {
        *v = (l + (*v - l) * p.saturation).clamp(0.0, 1.0);
    }

    [c[0], c[1], c[2], px[3]]
}

pub fn invert(px: [f32; 4], mode: i32) -> [f32; 4] {
    match mode {
        1 => [1.0 - px[0], 1.0 - px[1], 1.0 - px[2], px[3]],
        2 => {
            let l = luma([px[0], px[1], px[2]]);
            let shift = (1.0 - l) - l;
            [
                (px[0] + shift).clamp(0.0, 1.0),
                (px[1] + shift).clamp(0.0, 1.0),
                (px[2] + shift).clamp(0.0, 1.0),
                px[3],
            ]
        }
        _ => px,
    }
}

/// Laplacian sharpening; neighbours are north, south, east, west.
pub fn edge_enhance(px: [f32; 4], neighbours: [[f32; 4]; 4], strength: f32) -> [f32; 4] {
    let mut out = px;
    for i in 0..3 {
        let laplacian = 4.0 * px[i] - neighbours.iter().map(|n| n[i]).sum::<f32>();
        out[i] = (px[i] + strength * laplacian).clamp(0.0, 1.0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use claritylayer_core::TransformParameters;

    fn block(params: TransformParameters) -> ParamBlock {
        ParamBlock::new(&params, Extent::new(1, 1))
    }

    #[test]
    fn test_adjust_identity_is_lossless() {
        let px = [0.12, 0.5, 0.93, 0.7];
        let out = adjust(px, &block(TransformParameters::default()));
        for i in 0..4 {
            assert!((out[i] - px[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zero_saturation_yields_grey() {
        let params = TransformParameters {
            saturation: 0.0,
            ..TransformParameters::default()
        };
        let out = adjust([1.0, 0.0, 0.0, 1.0], &block(params));
        assert!((out[0] - LUMA[0]).abs() < 1e-6);
        assert!((out[0] - out[1]).abs() < 1e-6);
        assert!((out[1] - out[2]).abs() < 1e-6);
    }

    #[test]
    fn test_brightness_only_inversion_keeps_chroma() {
        let px = [0.8, 0.3, 0.2, 1.0];
        let out = invert(px, 2);
        let before = luma([px[0], px[1], px[2]]);
        let after = luma([out[0], out[1], out[2]]);
        assert!((after - (1.0 - before)).abs() < 1e-5);
        assert!(((out[0] - out[1]) - (px[0] - px[1])).abs() < 1e-5);
    }

    #[test]
    fn test_edge_enhance_leaves_flat_regions_alone() {
        let flat = [0.4, 0.4, 0.4, 1.0];
        assert_eq!(edge_enhance(flat, [flat; 4], 1.0), flat);
    }

    #[test]
    fn test_draw_pass_rejects_aliased_target() {
        let device = SoftwareDevice::new();
        let program = device.compile_program(PassKind::Passthrough, "float4 PSMain()").unwrap();
        let uniforms = device.create_uniforms().unwrap();
        let texture = device.create_target(Extent::new(2, 2)).unwrap();
        assert!(device.draw_pass(&program, &uniforms, &texture, &texture).is_err());
    }

    #[test]
    fn test_compile_rejects_source_without_entry_point() {
        let device = SoftwareDevice::new();
        assert!(matches!(
            device.compile_program(PassKind::Adjust, "garbage"),
            Err(GpuError::ShaderCompile { pass: "adjust", .. })
        ));
    }
}
