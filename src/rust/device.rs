//! Device-resident tensors for the fixed-batch path.

use std::fmt;
use std::sync::Arc;

use crate::backend::{Backend, DeviceMemory, DevicePtr};
use crate::error::Result;
use crate::tensor::{DataType, Shape, Tensor};

/// A dense tensor living in device memory. Freed when dropped.
pub struct DeviceTensor {
    memory: Box<dyn DeviceMemory>,
    dtype: DataType,
    shape: Shape,
    backend: Arc<dyn Backend>,
}

impl DeviceTensor {
    /// Allocates uninitialized device memory for `shape`.
    pub fn alloc(backend: &Arc<dyn Backend>, dtype: DataType, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        backend.bind_thread()?;
        let memory = backend.alloc_device(shape.volume() * dtype.size())?;
        Ok(Self {
            memory,
            dtype,
            shape,
            backend: backend.clone(),
        })
    }

    /// Copies a host tensor to the device and waits for the copy.
    pub fn upload(backend: &Arc<dyn Backend>, tensor: &Tensor) -> Result<Self> {
        let device = Self::alloc(backend, tensor.dtype(), tensor.shape().clone())?;
        backend.copy_to_device(device.memory.as_ref(), tensor.as_bytes())?;
        Ok(device)
    }

    /// Copies the tensor back to host memory.
    pub fn download(&self) -> Result<Tensor> {
        let mut data = vec![0u8; self.byte_len()];
        self.backend.bind_thread()?;
        self.backend.copy_from_device(&mut data, self.memory.as_ref())?;
        Tensor::from_bytes(self.dtype, self.shape.clone(), data)
    }

    /// Backend that owns the allocation.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Leading dimension.
    pub fn len(&self) -> usize {
        self.shape.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.memory.len()
    }

    pub fn ptr(&self) -> DevicePtr {
        self.memory.ptr()
    }
}

impl fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("backend", &self.backend.name())
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("ptr", &format_args!("{:#x}", self.ptr()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReferenceBackend;

    #[test]
    fn upload_then_download_preserves_contents() {
        let backend: Arc<dyn Backend> = Arc::new(ReferenceBackend::new());
        let host = Tensor::from_f32(DataType::Half, vec![2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let device = DeviceTensor::upload(&backend, &host).unwrap();
        assert_eq!(device.len(), 2);
        assert_eq!(device.byte_len(), 12);
        assert_eq!(device.download().unwrap(), host);
    }
}
