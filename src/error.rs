use claritylayer_core::ParamError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no GPU device is bound")]
    NoDevice,
    #[error("shader compilation failed for {pass}: {message}")]
    ShaderCompile { pass: &'static str, message: String },
    #[error("resource creation failed: {0}")]
    Resource(String),
    #[error("texture size mismatch: {0}")]
    Extent(String),
    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture is not supported on this system")]
    Unsupported,
    #[error("capture source is not bound to a GPU device")]
    NoDevice,
    #[error("no capture sessions could be created")]
    NoSessions,
    #[error("failed to enumerate monitors: {0}")]
    Enumeration(String),
    #[error("failed to open capture for monitor {monitor}: {message}")]
    Open { monitor: String, message: String },
    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),
}

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("presentation surface is not initialized")]
    NotInitialized,
    #[error("failed to create GPU device: {0}")]
    Device(String),
    #[error("failed to create overlay window: {0}")]
    Window(String),
    #[error("failed to create swap chain: {0}")]
    SwapChain(String),
    #[error("failed to resize presentation buffers: {0}")]
    Resize(String),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("required shader pass '{0}' is missing")]
    MissingPass(&'static str),
    #[error("input texture has zero size")]
    EmptyInput,
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("an event hook for {0} is already installed")]
    AlreadyInstalled(&'static str),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("safe mode is active; exit safe mode before enabling effects")]
    SafeModeActive,
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
