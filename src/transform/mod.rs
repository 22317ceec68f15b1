// Ordered multi-pass transform over ping-pong buffers
use crate::error::{GpuError, PipelineError};
use crate::gpu::{DeviceHandle, Extent, ParamBlock, PassKind, RenderDevice, ShaderAssets};
use claritylayer_core::{log_info, log_warn, ParamError, ParamName, TransformParameters};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct ParamState {
    params: TransformParameters,
    dirty: bool,
}

/// Live-tunable parameters shared between the command thread and the render path.
///
/// Every write clamps and marks the block dirty. The pipeline takes the dirty
/// snapshot once per frame, so any number of writes between two frames cost a
/// single upload.
pub struct SharedParameters {
    state: Mutex<ParamState>,
}

impl Default for SharedParameters {
    fn default() -> Self {
        Self::new(TransformParameters::default())
    }
}

impl SharedParameters {
    pub fn new(params: TransformParameters) -> Self {
        Self {
            state: Mutex::new(ParamState {
                params: params.clamped(),
                dirty: true,
            }),
        }
    }

    pub fn snapshot(&self) -> TransformParameters {
        self.state.lock().params
    }

    /// Sets one field and returns the value actually stored.
    pub fn set(&self, name: ParamName, value: f32) -> f32 {
        let mut state = self.state.lock();
        state.params.set(name, value);
        state.dirty = true;
        state.params.get(name)
    }

    pub fn set_named(&self, name: &str, value: f32) -> Result<f32, ParamError> {
        let name: ParamName = name.parse()?;
        Ok(self.set(name, value))
    }

    /// Whole-set replacement with a single dirty mark.
    pub fn replace(&self, params: TransformParameters) {
        let mut state = self.state.lock();
        state.params = params.clamped();
        state.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn take_dirty(&self) -> Option<TransformParameters> {
        let mut state = self.state.lock();
        if state.dirty {
            state.dirty = false;
            Some(state.params)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Input,
    Scratch,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassStep {
    pub pass: PassKind,
    pub source: Slot,
    pub target: Slot,
}

/// Decides which passes run and which buffer each one reads and writes.
///
/// The combination pass always writes scratch. Each optional pass writes the
/// buffer the previous pass did not. If the last pass landed in scratch a
/// passthrough copies it into the output slot, so the plan always ends there.
pub fn plan_passes(params: &TransformParameters, edge_available: bool) -> Vec<PassStep> {
    let mut plan = vec![PassStep {
        pass: PassKind::Adjust,
        source: Slot::Input,
        target: Slot::Scratch,
    }];
    let mut current = Slot::Scratch;

    let mut optional = Vec::with_capacity(3);
    if params.invert_mode.as_index() != 0 {
        optional.push(PassKind::Invert);
    }
    if params.edge_strength > 0.0 && edge_available {
        optional.push(PassKind::EdgeEnhance);
    }

    for pass in optional {
        let target = other_buffer(current);
        plan.push(PassStep {
            pass,
            source: current,
            target,
        });
        current = target;
    }

    if current != Slot::Output {
        plan.push(PassStep {
            pass: PassKind::Passthrough,
            source: current,
            target: Slot::Output,
        });
    }
    plan
}

fn other_buffer(slot: Slot) -> Slot {
    match slot {
        Slot::Scratch => Slot::Output,
        _ => Slot::Scratch,
    }
}

struct PingPong<T> {
    extent: Extent,
    scratch: T,
    output: T,
}

struct DeviceResources<D: RenderDevice> {
    device: Arc<D>,
    programs: HashMap<PassKind, D::Program>,
    uniforms: D::Uniforms,
    buffers: Option<PingPong<D::Texture>>,
}

pub struct TransformPipeline<D: RenderDevice> {
    device: DeviceHandle<D>,
    assets: ShaderAssets,
    params: Arc<SharedParameters>,
    resources: Option<DeviceResources<D>>,
    stale: Arc<AtomicBool>,
    edge_available: bool,
    active: TransformParameters,
    uploaded_extent: Option<Extent>,
    force_upload: bool,
    last_plan: Vec<PassStep>,
}

impl<D: RenderDevice> TransformPipeline<D> {
    pub fn new(device: DeviceHandle<D>, assets: ShaderAssets, params: Arc<SharedParameters>) -> Self {
        Self {
            device,
            assets,
            params,
            resources: None,
            stale: Arc::new(AtomicBool::new(false)),
            edge_available: false,
            active: TransformParameters::default(),
            uploaded_extent: None,
            force_upload: true,
            last_plan: Vec::new(),
        }
    }

    /// Compiles every pass against the current device.
    pub fn initialize(&mut self) -> Result<(), PipelineError> {
        self.rebuild()?;
        log_info!(
            "Transform pipeline ready ({} passes, edge enhancement {})",
            self.resources.as_ref().map(|r| r.programs.len()).unwrap_or(0),
            if self.edge_available { "available" } else { "unavailable" }
        );
        Ok(())
    }

    fn rebuild(&mut self) -> Result<(), PipelineError> {
        self.resources = None;
        let device = self.device.require()?;

        let mut programs = HashMap::new();
        for kind in PassKind::ALL {
            match self.assets.source(kind) {
                Some(source) => match device.compile_program(kind, source) {
                    Ok(program) => {
                        programs.insert(kind, program);
                    }
                    Err(e) if kind.is_required() => return Err(e.into()),
                    Err(e) => log_warn!("Optional pass disabled: {}", e),
                },
                None if kind.is_required() => return Err(PipelineError::MissingPass(kind.name())),
                None => log_warn!("Shader asset for {} pass not available, skipping it", kind.name()),
            }
        }

        let uniforms = device.create_uniforms()?;
        self.edge_available = programs.contains_key(&PassKind::EdgeEnhance);
        self.force_upload = true;
        self.uploaded_extent = None;
        self.resources = Some(DeviceResources {
            device,
            programs,
            uniforms,
            buffers: None,
        });
        Ok(())
    }

    /// Callback for the device-recovered notification.
    pub fn recovery_listener(&self) -> impl Fn() + Send + Sync + 'static {
        let stale = Arc::clone(&self.stale);
        move || stale.store(true, Ordering::Release)
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub fn edge_available(&self) -> bool {
        self.edge_available
    }

    pub fn parameters(&self) -> &Arc<SharedParameters> {
        &self.params
    }

    pub fn buffer_extent(&self) -> Option<Extent> {
        self.resources
            .as_ref()
            .and_then(|r| r.buffers.as_ref())
            .map(|b| b.extent)
    }

    pub fn last_plan(&self) -> &[PassStep] {
        &self.last_plan
    }

    /// Runs the pass plan over `input`.
    ///
    /// The returned texture is one of the pipeline's own buffers and is only
    /// valid until the next call.
    pub fn process(&mut self, input: &D::Texture) -> Result<&D::Texture, PipelineError> {
        if self.stale.swap(false, Ordering::AcqRel) {
            log_info!("Rebuilding transform resources after device recovery");
            self.resources = None;
        }
        if self.resources.is_none() {
            self.rebuild()?;
        }

        let resources = self
            .resources
            .as_mut()
            .ok_or(PipelineError::Gpu(GpuError::NoDevice))?;
        let device = Arc::clone(&resources.device);

        let extent = device.texture_extent(input);
        if extent.is_empty() {
            return Err(PipelineError::EmptyInput);
        }

        if resources.buffers.as_ref().map(|b| b.extent) != Some(extent) {
            resources.buffers = None;
            let scratch = device.create_target(extent)?;
            let output = device.create_target(extent)?;
            tracing::debug!("Allocated ping-pong buffers at {}", extent);
            resources.buffers = Some(PingPong {
                extent,
                scratch,
                output,
            });
        }

        let dirty = self.params.take_dirty();
        if dirty.is_some() || self.force_upload || self.uploaded_extent != Some(extent) {
            let params = dirty.unwrap_or_else(|| self.params.snapshot());
            if let Err(e) = device.write_uniforms(&resources.uniforms, &ParamBlock::new(&params, extent)) {
                // The dirty mark is already consumed; retry on the next frame
                self.force_upload = true;
                return Err(e.into());
            }
            self.active = params;
            self.force_upload = false;
            self.uploaded_extent = Some(extent);
        }

        self.last_plan = plan_passes(&self.active, self.edge_available);

        let buffers = resources
            .buffers
            .as_ref()
            .ok_or_else(|| PipelineError::Gpu(GpuError::Resource("ping-pong buffers missing".into())))?;

        for step in &self.last_plan {
            let program = resources
                .programs
                .get(&step.pass)
                .ok_or(PipelineError::MissingPass(step.pass.name()))?;
            let source = match step.source {
                Slot::Input => input,
                Slot::Scratch => &buffers.scratch,
                Slot::Output => &buffers.output,
            };
            let target = match step.target {
                Slot::Scratch => &buffers.scratch,
                Slot::Output => &buffers.output,
                Slot::Input => return Err(PipelineError::MissingPass(step.pass.name())),
            };
            device.draw_pass(program, &resources.uniforms, source, target)?;
        }

        Ok(&buffers.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::software::{SoftTexture, SoftwareDevice};
    use crate::gpu::DeviceSlot;
    use claritylayer_core::InvertMode;

    fn pipeline(assets: ShaderAssets) -> (TransformPipeline<SoftwareDevice>, DeviceSlot<SoftwareDevice>, Arc<SharedParameters>) {
        let slot = DeviceSlot::new();
        slot.publish(Arc::new(SoftwareDevice::new()));
        let params = Arc::new(SharedParameters::default());
        let pipeline = TransformPipeline::new(slot.handle(), assets, Arc::clone(&params));
        (pipeline, slot, params)
    }

    fn passes(plan: &[PassStep]) -> Vec<PassKind> {
        plan.iter().map(|s| s.pass).collect()
    }

    #[test]
    fn test_plan_always_ends_in_output() {
        for invert in [InvertMode::None, InvertMode::Full, InvertMode::BrightnessOnly] {
            for edge in [0.0, 0.5] {
                for available in [true, false] {
                    let params = TransformParameters {
                        invert_mode: invert,
                        edge_strength: edge,
                        ..TransformParameters::default()
                    };
                    let plan = plan_passes(&params, available);
                    assert_eq!(plan.last().map(|s| s.target), Some(Slot::Output));
                    assert_eq!(plan[0].source, Slot::Input);
                    for pair in plan.windows(2) {
                        assert_eq!(pair[0].target, pair[1].source);
                        assert_ne!(pair[1].source, pair[1].target);
                    }
                }
            }
        }
    }

    #[test]
    fn test_plan_adds_passthrough_only_after_scratch() {
        let identity = TransformParameters::default();
        assert_eq!(passes(&plan_passes(&identity, true)), vec![PassKind::Adjust, PassKind::Passthrough]);

        let inverted = TransformParameters {
            invert_mode: InvertMode::Full,
            ..identity
        };
        assert_eq!(passes(&plan_passes(&inverted, true)), vec![PassKind::Adjust, PassKind::Invert]);

        let both = TransformParameters {
            edge_strength: 0.3,
            ..inverted
        };
        assert_eq!(
            passes(&plan_passes(&both, true)),
            vec![PassKind::Adjust, PassKind::Invert, PassKind::EdgeEnhance, PassKind::Passthrough]
        );
    }

    #[test]
    fn test_plan_skips_edge_without_asset() {
        let params = TransformParameters {
            invert_mode: InvertMode::Full,
            edge_strength: 1.0,
            ..TransformParameters::default()
        };
        assert_eq!(passes(&plan_passes(&params, false)), vec![PassKind::Adjust, PassKind::Invert]);
    }

    #[test]
    fn test_setters_coalesce_into_one_upload() {
        let (mut pipeline, slot, params) = pipeline(ShaderAssets::builtin());
        let device = slot.current().unwrap();
        let input = SoftTexture::filled(Extent::new(4, 4), [0.5, 0.5, 0.5, 1.0]);

        pipeline.process(&input).unwrap();
        let baseline = device.upload_count();

        params.set(ParamName::Contrast, 1.2);
        params.set(ParamName::Brightness, 0.1);
        params.set(ParamName::Gamma, 1.1);
        pipeline.process(&input).unwrap();
        assert_eq!(device.upload_count(), baseline + 1);

        pipeline.process(&input).unwrap();
        assert_eq!(device.upload_count(), baseline + 1);
    }

    #[test]
    fn test_failed_upload_is_retried_next_frame() {
        let (mut pipeline, slot, params) = pipeline(ShaderAssets::builtin());
        let device = slot.current().unwrap();
        let input = SoftTexture::filled(Extent::new(4, 4), [0.5, 0.5, 0.5, 1.0]);
        pipeline.process(&input).unwrap();

        params.set(ParamName::Brightness, 0.2);
        device.fail_uploads(true);
        assert!(pipeline.process(&input).is_err());

        device.fail_uploads(false);
        let out = pipeline.process(&input).unwrap();
        assert!((out.pixel(1, 1)[0] - 0.7).abs() < 1e-4);
    }

    #[test]
    fn test_buffers_reallocate_only_on_resize() {
        let (mut pipeline, slot, _params) = pipeline(ShaderAssets::builtin());
        let device = slot.current().unwrap();
        let small = SoftTexture::filled(Extent::new(4, 4), [0.2; 4]);
        let large = SoftTexture::filled(Extent::new(8, 4), [0.2; 4]);

        pipeline.process(&small).unwrap();
        pipeline.process(&small).unwrap();
        assert_eq!(device.allocation_count(), 2);

        let out = pipeline.process(&large).unwrap();
        assert_eq!(out.extent(), Extent::new(8, 4));
        assert_eq!(device.allocation_count(), 4);
        assert_eq!(pipeline.buffer_extent(), Some(Extent::new(8, 4)));
    }

    #[test]
    fn test_zero_sized_input_is_rejected() {
        let (mut pipeline, _slot, _params) = pipeline(ShaderAssets::builtin());
        let empty = SoftTexture::from_image(image::Rgba32FImage::new(0, 0));
        assert!(matches!(pipeline.process(&empty), Err(PipelineError::EmptyInput)));
    }

    #[test]
    fn test_missing_required_pass_fails_initialization() {
        let (mut pipeline, _slot, _params) = pipeline(ShaderAssets::builtin().without(PassKind::Invert));
        assert!(matches!(pipeline.initialize(), Err(PipelineError::MissingPass("invert"))));
    }

    #[test]
    fn test_uncompilable_edge_pass_degrades() {
        let assets = ShaderAssets::builtin().with_source(PassKind::EdgeEnhance, "not a shader");
        let (mut pipeline, _slot, _params) = pipeline(assets);
        pipeline.initialize().unwrap();
        assert!(!pipeline.edge_available());
    }

    #[test]
    fn test_recovery_rebuilds_against_new_device() {
        let (mut pipeline, slot, _params) = pipeline(ShaderAssets::builtin());
        let input = SoftTexture::filled(Extent::new(2, 2), [0.3; 4]);
        pipeline.process(&input).unwrap();

        let listener = pipeline.recovery_listener();
        slot.revoke();
        let replacement = Arc::new(SoftwareDevice::new());
        slot.publish(Arc::clone(&replacement));
        listener();
        assert!(pipeline.is_stale());

        pipeline.process(&input).unwrap();
        assert!(!pipeline.is_stale());
        assert_eq!(replacement.allocation_count(), 2);
        assert_eq!(replacement.upload_count(), 1);
    }

    #[test]
    fn test_process_without_device_fails() {
        let slot: DeviceSlot<SoftwareDevice> = DeviceSlot::new();
        let mut pipeline = TransformPipeline::new(slot.handle(), ShaderAssets::builtin(), Arc::default());
        let input = SoftTexture::filled(Extent::new(2, 2), [0.3; 4]);
        assert!(matches!(pipeline.process(&input), Err(PipelineError::Gpu(GpuError::NoDevice))));
    }
}
