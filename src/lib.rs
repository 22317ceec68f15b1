pub mod capture;
pub mod controller;
pub mod error;
pub mod events;
pub mod gpu;
pub mod guard;
pub mod platform;
pub mod surface;
pub mod transform;

pub use capture::{FrameSource, MonitorDescriptor, Rect};
pub use controller::{Controller, ControllerOptions};
pub use error::{CaptureError, ControlError, GpuError, HookError, PipelineError, SurfaceError};
pub use events::{Command, ControlEvent, EventHub, EventHook, HookKind, HookRegistry};
pub use guard::{LivenessGuard, PanicReason, Watchdog};
pub use surface::{PresentOutcome, PresentationSurface, SurfaceState};
pub use transform::{SharedParameters, TransformPipeline};

pub use claritylayer_core::{log_error, log_info, log_warn};
pub use claritylayer_core::{AppConfig, Config, InvertMode, PersistedState, StateManager, TransformParameters, VisualProfile};
