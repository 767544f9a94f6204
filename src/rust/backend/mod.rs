//! Runtime backends.
//!
//! The wrapper never talks to a driver directly. Everything it needs from the
//! inference runtime (engine deserialization, execution contexts) and from the
//! device driver (pinned host memory, device memory, streams) goes through the
//! traits below.

pub mod reference;
#[cfg(feature = "tensorrt")]
mod ffi;
#[cfg(feature = "tensorrt")]
pub mod tensorrt;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tensor::{DataType, Shape};

pub use reference::{FaultPlan, ReferenceBackend, ReferenceModel};
#[cfg(feature = "tensorrt")]
pub use tensorrt::TensorRtBackend;

/// Address in a backend's device address space.
pub type DevicePtr = u64;

/// Supported backend types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Reference,
    TensorRt,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Reference => "reference",
            BackendKind::TensorRt => "tensorrt",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reference" | "host" => Ok(BackendKind::Reference),
            "tensorrt" | "trt" => Ok(BackendKind::TensorRt),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// One input or output slot of an engine. The shape excludes the batch dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingDesc {
    pub name: String,
    pub is_input: bool,
    pub dtype: DataType,
    pub shape: Shape,
}

impl BindingDesc {
    /// Bytes occupied by one sample.
    pub fn byte_size(&self) -> usize {
        self.shape.volume() * self.dtype.size()
    }

    pub fn signature(&self) -> String {
        format!("{}[{}]", self.dtype, self.shape)
    }
}

/// Host memory reachable by the device's copy engine.
pub trait HostMemory: Send {
    fn as_bytes(&self) -> &[u8];
    fn as_bytes_mut(&mut self) -> &mut [u8];

    fn len(&self) -> usize {
        self.as_bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A device allocation. Released when dropped.
pub trait DeviceMemory: Send {
    fn ptr(&self) -> DevicePtr;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered queue of asynchronous device operations.
///
/// Host memory passed to the copy methods must stay alive and untouched
/// until `synchronize` returns.
pub trait Stream: Send {
    fn copy_htod(&self, dst: &dyn DeviceMemory, src: &dyn HostMemory) -> Result<()>;
    fn copy_dtoh(&self, dst: &mut dyn HostMemory, src: &dyn DeviceMemory) -> Result<()>;
    fn synchronize(&self) -> Result<()>;

    /// Native stream handle handed to the runtime, 0 when there is none.
    fn raw_handle(&self) -> usize {
        0
    }
}

/// Invocation state for one engine. Borrows the engine it was created from.
pub trait ExecutionContext {
    /// Enqueues one execution of `batch_size` samples on `stream`.
    /// `bindings` holds one device pointer per engine binding.
    fn enqueue(&mut self, batch_size: usize, bindings: &[DevicePtr], stream: &dyn Stream) -> Result<()>;
}

/// A deserialized engine.
pub trait EngineHandle: Send {
    fn num_bindings(&self) -> usize;
    fn binding(&self, index: usize) -> Result<BindingDesc>;
    fn max_batch_size(&self) -> usize;
    fn create_context(&self) -> Result<Box<dyn ExecutionContext + '_>>;
}

/// Trait implemented by each runtime backend. It exposes the minimal surface
/// the wrapper needs to load an engine and move data through it.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;
    fn name(&self) -> &'static str;

    /// Process-wide driver setup. Must be idempotent.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Makes this backend's device current on the calling thread. Device
    /// selection is per host thread, so every entry point that issues device
    /// work calls this first.
    fn bind_thread(&self) -> Result<()> {
        Ok(())
    }

    fn deserialize_engine(&self, blob: &[u8]) -> Result<Box<dyn EngineHandle>>;
    fn alloc_host(&self, len: usize) -> Result<Box<dyn HostMemory>>;
    fn alloc_device(&self, len: usize) -> Result<Box<dyn DeviceMemory>>;
    fn create_stream(&self) -> Result<Box<dyn Stream>>;

    /// Blocking copy from an ordinary host slice.
    fn copy_to_device(&self, dst: &dyn DeviceMemory, src: &[u8]) -> Result<()>;
    /// Blocking copy into an ordinary host slice.
    fn copy_from_device(&self, dst: &mut [u8], src: &dyn DeviceMemory) -> Result<()>;
}

/// Builds the backend for `kind`. `device` selects the GPU ordinal where it applies.
pub fn create(kind: BackendKind, device: i32) -> Result<Arc<dyn Backend>> {
    match kind {
        BackendKind::Reference => Ok(Arc::new(ReferenceBackend::new())),
        #[cfg(feature = "tensorrt")]
        BackendKind::TensorRt => Ok(Arc::new(TensorRtBackend::new(device))),
        #[cfg(not(feature = "tensorrt"))]
        BackendKind::TensorRt => {
            let _ = device;
            Err(crate::error::EngineError::runtime(
                "tensorrt",
                "create",
                "built without the `tensorrt` feature",
            ))
        }
    }
}
