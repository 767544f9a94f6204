//! TensorRT backend over the CUDA runtime.

use std::ffi::{c_void, CStr};
use std::marker::PhantomData;
use std::os::raw::c_int;
use std::ptr;
use std::sync::OnceLock;

use tracing::{debug, warn};

use super::ffi;
use super::{
    Backend, BackendKind, BindingDesc, DeviceMemory, DevicePtr, EngineHandle, ExecutionContext,
    HostMemory, Stream,
};
use crate::error::{EngineError, Result};
use crate::tensor::{DataType, Shape};

const BACKEND: &str = "tensorrt";
const MAX_DIMS: usize = 8;

/// Result of the one-time driver context setup.
static DRIVER_INIT: OnceLock<ffi::cudaError_t> = OnceLock::new();

fn error_string(code: ffi::cudaError_t) -> String {
    // SAFETY: cudaGetErrorString returns a static string for any code
    unsafe {
        let msg = ffi::cudaGetErrorString(code);
        if msg.is_null() {
            format!("cuda error {}", code)
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

fn check(code: ffi::cudaError_t, op: &'static str) -> Result<()> {
    if code == ffi::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(EngineError::runtime(BACKEND, op, error_string(code)))
    }
}

fn check_fits(len: usize, capacity: usize, op: &'static str) -> Result<()> {
    if len > capacity {
        return Err(EngineError::runtime(
            BACKEND,
            op,
            format!("copy of {} bytes exceeds allocation of {} bytes", len, capacity),
        ));
    }
    Ok(())
}

/// TensorRT runtime bound to one CUDA device.
#[derive(Debug, Clone)]
pub struct TensorRtBackend {
    device: i32,
}

impl TensorRtBackend {
    pub fn new(device: i32) -> Self {
        Self { device }
    }
}

impl Backend for TensorRtBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::TensorRt
    }

    fn name(&self) -> &'static str {
        BACKEND
    }

    fn initialize(&self) -> Result<()> {
        self.bind_thread()?;
        // cudaFree(NULL) forces the primary context into existence once per process
        // SAFETY: plain driver call without pointer arguments
        let code = *DRIVER_INIT.get_or_init(|| unsafe { ffi::cudaFree(ptr::null_mut()) });
        check(code, "cudaFree")?;
        debug!(device = self.device, "cuda driver initialized");
        Ok(())
    }

    fn bind_thread(&self) -> Result<()> {
        // SAFETY: plain driver call without pointer arguments
        check(unsafe { ffi::cudaSetDevice(self.device) }, "cudaSetDevice")
    }

    fn deserialize_engine(&self, blob: &[u8]) -> Result<Box<dyn EngineHandle>> {
        // SAFETY: the shim returns null on failure and owns nothing we pass in
        unsafe {
            let runtime = ffi::trt_runtime_create();
            if runtime.is_null() {
                return Err(EngineError::runtime(
                    BACKEND,
                    "trt_runtime_create",
                    "failed to create runtime",
                ));
            }

            let engine = ffi::trt_deserialize_engine(runtime, blob.as_ptr() as *const c_void, blob.len());
            if engine.is_null() {
                ffi::trt_runtime_destroy(runtime);
                return Err(EngineError::Deserialization(
                    "runtime rejected the engine blob (corrupt or built for another TensorRT version)"
                        .to_string(),
                ));
            }

            Ok(Box::new(TrtEngine { runtime, engine }))
        }
    }

    fn alloc_host(&self, len: usize) -> Result<Box<dyn HostMemory>> {
        let mut raw: *mut c_void = ptr::null_mut();
        if len > 0 {
            // SAFETY: raw is a valid out pointer
            check(
                unsafe { ffi::cudaHostAlloc(&mut raw, len, ffi::CUDA_HOST_ALLOC_DEFAULT) },
                "cudaHostAlloc",
            )?;
            // SAFETY: freshly allocated, len bytes
            unsafe { ptr::write_bytes(raw as *mut u8, 0, len) };
        }
        Ok(Box::new(PinnedBuffer {
            ptr: raw as *mut u8,
            len,
        }))
    }

    fn alloc_device(&self, len: usize) -> Result<Box<dyn DeviceMemory>> {
        let mut raw: *mut c_void = ptr::null_mut();
        if len > 0 {
            // SAFETY: raw is a valid out pointer
            check(unsafe { ffi::cudaMalloc(&mut raw, len) }, "cudaMalloc")?;
        }
        Ok(Box::new(DeviceBuffer { ptr: raw, len }))
    }

    fn create_stream(&self) -> Result<Box<dyn Stream>> {
        let mut raw: ffi::cudaStream_t = ptr::null_mut();
        // SAFETY: raw is a valid out pointer
        check(unsafe { ffi::cudaStreamCreate(&mut raw) }, "cudaStreamCreate")?;
        Ok(Box::new(CudaStream { raw }))
    }

    fn copy_to_device(&self, dst: &dyn DeviceMemory, src: &[u8]) -> Result<()> {
        check_fits(src.len(), dst.len(), "cudaMemcpy")?;
        if src.is_empty() {
            return Ok(());
        }
        // SAFETY: bounds checked above, blocking copy
        check(
            unsafe {
                ffi::cudaMemcpy(
                    dst.ptr() as *mut c_void,
                    src.as_ptr() as *const c_void,
                    src.len(),
                    ffi::CUDA_MEMCPY_HOST_TO_DEVICE,
                )
            },
            "cudaMemcpy",
        )
    }

    fn copy_from_device(&self, dst: &mut [u8], src: &dyn DeviceMemory) -> Result<()> {
        check_fits(dst.len(), src.len(), "cudaMemcpy")?;
        if dst.is_empty() {
            return Ok(());
        }
        // SAFETY: bounds checked above, blocking copy
        check(
            unsafe {
                ffi::cudaMemcpy(
                    dst.as_mut_ptr() as *mut c_void,
                    src.ptr() as *const c_void,
                    dst.len(),
                    ffi::CUDA_MEMCPY_DEVICE_TO_HOST,
                )
            },
            "cudaMemcpy",
        )
    }
}

/// Page-locked host memory from `cudaHostAlloc`.
struct PinnedBuffer {
    ptr: *mut u8,
    len: usize,
}

// The buffer is exclusively owned; the pointer is never shared.
unsafe impl Send for PinnedBuffer {}

impl HostMemory for PinnedBuffer {
    fn as_bytes(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: ptr points to len initialized bytes owned by self
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: as above, and &mut self guarantees exclusivity
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        let code = unsafe { ffi::cudaFreeHost(self.ptr as *mut c_void) };
        if code != ffi::CUDA_SUCCESS {
            warn!(error = %error_string(code), "cudaFreeHost failed");
        }
    }
}

struct DeviceBuffer {
    ptr: *mut c_void,
    len: usize,
}

unsafe impl Send for DeviceBuffer {}

impl DeviceMemory for DeviceBuffer {
    fn ptr(&self) -> DevicePtr {
        self.ptr as DevicePtr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        let code = unsafe { ffi::cudaFree(self.ptr) };
        if code != ffi::CUDA_SUCCESS {
            warn!(error = %error_string(code), "cudaFree failed");
        }
    }
}

struct CudaStream {
    raw: ffi::cudaStream_t,
}

unsafe impl Send for CudaStream {}

impl Stream for CudaStream {
    fn copy_htod(&self, dst: &dyn DeviceMemory, src: &dyn HostMemory) -> Result<()> {
        check_fits(src.len(), dst.len(), "cudaMemcpyAsync")?;
        if src.is_empty() {
            return Ok(());
        }
        // SAFETY: bounds checked; the caller keeps src alive until synchronize
        check(
            unsafe {
                ffi::cudaMemcpyAsync(
                    dst.ptr() as *mut c_void,
                    src.as_bytes().as_ptr() as *const c_void,
                    src.len(),
                    ffi::CUDA_MEMCPY_HOST_TO_DEVICE,
                    self.raw,
                )
            },
            "cudaMemcpyAsync",
        )
    }

    fn copy_dtoh(&self, dst: &mut dyn HostMemory, src: &dyn DeviceMemory) -> Result<()> {
        check_fits(dst.len(), src.len(), "cudaMemcpyAsync")?;
        if dst.is_empty() {
            return Ok(());
        }
        let len = dst.len();
        // SAFETY: bounds checked; the caller keeps dst alive until synchronize
        check(
            unsafe {
                ffi::cudaMemcpyAsync(
                    dst.as_bytes_mut().as_mut_ptr() as *mut c_void,
                    src.ptr() as *const c_void,
                    len,
                    ffi::CUDA_MEMCPY_DEVICE_TO_HOST,
                    self.raw,
                )
            },
            "cudaMemcpyAsync",
        )
    }

    fn synchronize(&self) -> Result<()> {
        check(unsafe { ffi::cudaStreamSynchronize(self.raw) }, "cudaStreamSynchronize")
    }

    fn raw_handle(&self) -> usize {
        self.raw as usize
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        let code = unsafe { ffi::cudaStreamDestroy(self.raw) };
        if code != ffi::CUDA_SUCCESS {
            warn!(error = %error_string(code), "cudaStreamDestroy failed");
        }
    }
}

struct TrtEngine {
    runtime: *mut ffi::TrtRuntime,
    engine: *mut ffi::TrtEngine,
}

unsafe impl Send for TrtEngine {}

impl TrtEngine {
    fn check_index(&self, index: usize) -> Result<c_int> {
        if index >= self.num_bindings() {
            return Err(EngineError::runtime(
                BACKEND,
                "binding",
                format!("no binding at index {}", index),
            ));
        }
        Ok(index as c_int)
    }
}

impl EngineHandle for TrtEngine {
    fn num_bindings(&self) -> usize {
        let n = unsafe { ffi::trt_engine_num_bindings(self.engine) };
        n.max(0) as usize
    }

    fn binding(&self, index: usize) -> Result<BindingDesc> {
        let idx = self.check_index(index)?;
        // SAFETY: index validated, engine alive for the duration of self
        unsafe {
            let name_ptr = ffi::trt_engine_binding_name(self.engine, idx);
            let name = if name_ptr.is_null() {
                format!("binding{}", index)
            } else {
                CStr::from_ptr(name_ptr).to_string_lossy().into_owned()
            };

            let raw_dtype = ffi::trt_engine_binding_dtype(self.engine, idx);
            let dtype = DataType::from_raw(raw_dtype).ok_or_else(|| {
                EngineError::runtime(
                    BACKEND,
                    "binding",
                    format!("binding {} has unsupported data type {}", index, raw_dtype),
                )
            })?;

            let mut dims = [0 as c_int; MAX_DIMS];
            let rank = ffi::trt_engine_binding_dims(self.engine, idx, dims.as_mut_ptr(), MAX_DIMS as c_int);
            if rank < 0 || rank as usize > MAX_DIMS {
                return Err(EngineError::runtime(
                    BACKEND,
                    "binding",
                    format!("binding {} reported rank {}", index, rank),
                ));
            }
            let dims = &dims[..rank as usize];
            if let Some(&d) = dims.iter().find(|&&d| d < 0) {
                return Err(EngineError::runtime(
                    BACKEND,
                    "binding",
                    format!("binding {} has dynamic dimension {}", index, d),
                ));
            }

            Ok(BindingDesc {
                name,
                is_input: ffi::trt_engine_binding_is_input(self.engine, idx) != 0,
                dtype,
                shape: Shape::new(dims.iter().map(|&d| d as usize).collect::<Vec<_>>()),
            })
        }
    }

    fn max_batch_size(&self) -> usize {
        let n = unsafe { ffi::trt_engine_max_batch_size(self.engine) };
        n.max(1) as usize
    }

    fn create_context(&self) -> Result<Box<dyn ExecutionContext + '_>> {
        let raw = unsafe { ffi::trt_context_create(self.engine) };
        if raw.is_null() {
            return Err(EngineError::runtime(
                BACKEND,
                "trt_context_create",
                "failed to create execution context",
            ));
        }
        Ok(Box::new(TrtContext {
            raw,
            _engine: PhantomData,
        }))
    }
}

impl Drop for TrtEngine {
    fn drop(&mut self) {
        unsafe {
            ffi::trt_engine_destroy(self.engine);
            ffi::trt_runtime_destroy(self.runtime);
        }
    }
}

struct TrtContext<'e> {
    raw: *mut ffi::TrtContext,
    _engine: PhantomData<&'e TrtEngine>,
}

impl ExecutionContext for TrtContext<'_> {
    fn enqueue(&mut self, batch_size: usize, bindings: &[DevicePtr], stream: &dyn Stream) -> Result<()> {
        let pointers: Vec<*mut c_void> = bindings.iter().map(|&p| p as *mut c_void).collect();
        // SAFETY: pointers reference live device allocations owned by the caller
        let ok = unsafe {
            ffi::trt_context_enqueue(
                self.raw,
                batch_size as c_int,
                pointers.as_ptr(),
                stream.raw_handle() as ffi::cudaStream_t,
            )
        };
        if ok != 1 {
            return Err(EngineError::runtime(
                BACKEND,
                "enqueue",
                format!("execution of batch {} failed to enqueue", batch_size),
            ));
        }
        Ok(())
    }
}

impl Drop for TrtContext<'_> {
    fn drop(&mut self) {
        unsafe { ffi::trt_context_destroy(self.raw) };
    }
}
