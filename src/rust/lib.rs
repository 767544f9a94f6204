pub mod backend;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod tensor;

pub use backend::{
    Backend, BackendKind, BindingDesc, DeviceMemory, DevicePtr, EngineHandle, ExecutionContext,
    FaultPlan, HostMemory, ReferenceBackend, ReferenceModel, Stream,
};
pub use config::{RunMode, RunnerConfig};
pub use device::DeviceTensor;
pub use engine::{Engine, EngineSummary};
pub use error::{EngineError, Result};
pub use tensor::{DataType, Shape, Tensor};
