pub mod config;
pub mod logger;
pub mod params;
pub mod state;

#[doc(hidden)]
pub use tracing as __tracing;

pub use config::{AppConfig, Config};
pub use params::{InvertMode, ParamError, ParamName, ParamRange, TransformParameters, VisualProfile};
pub use state::{PersistedState, StateManager};
