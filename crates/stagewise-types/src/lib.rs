pub mod config;
pub mod error;
pub mod tensor;

pub use config::{AxisPair, PipelineConfig, SchedulerConfig, StageAxes, StageConfig, StatePair};
pub use error::ConfigError;
pub use tensor::{DeviceKind, DevicePlacement, Tensor, TensorDtype, TensorView};
