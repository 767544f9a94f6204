//! Raw bindings to the CUDA runtime and the TensorRT C shim.
//!
//! TensorRT only ships a C++ API, so engine and context calls go through
//! `libtrt_shim`, a thin `extern "C"` layer over `nvinfer1::IRuntime`,
//! `ICudaEngine` and `IExecutionContext`. Memory and streams use `libcudart`
//! directly.

#![allow(non_camel_case_types)]

use std::ffi::c_void;
use std::os::raw::{c_char, c_int, c_uint};

pub type cudaError_t = c_int;
pub type cudaStream_t = *mut c_void;

pub const CUDA_SUCCESS: cudaError_t = 0;

pub const CUDA_MEMCPY_HOST_TO_DEVICE: c_int = 1;
pub const CUDA_MEMCPY_DEVICE_TO_HOST: c_int = 2;

pub const CUDA_HOST_ALLOC_DEFAULT: c_uint = 0;

extern "C" {
    pub fn cudaSetDevice(device: c_int) -> cudaError_t;
    pub fn cudaGetErrorString(error: cudaError_t) -> *const c_char;

    pub fn cudaMalloc(dev_ptr: *mut *mut c_void, size: usize) -> cudaError_t;
    pub fn cudaFree(dev_ptr: *mut c_void) -> cudaError_t;
    pub fn cudaHostAlloc(ptr: *mut *mut c_void, size: usize, flags: c_uint) -> cudaError_t;
    pub fn cudaFreeHost(ptr: *mut c_void) -> cudaError_t;

    pub fn cudaStreamCreate(stream: *mut cudaStream_t) -> cudaError_t;
    pub fn cudaStreamDestroy(stream: cudaStream_t) -> cudaError_t;
    pub fn cudaStreamSynchronize(stream: cudaStream_t) -> cudaError_t;

    pub fn cudaMemcpy(dst: *mut c_void, src: *const c_void, count: usize, kind: c_int) -> cudaError_t;
    pub fn cudaMemcpyAsync(
        dst: *mut c_void,
        src: *const c_void,
        count: usize,
        kind: c_int,
        stream: cudaStream_t,
    ) -> cudaError_t;
}

/// Opaque `nvinfer1::IRuntime`.
pub type TrtRuntime = c_void;
/// Opaque `nvinfer1::ICudaEngine`.
pub type TrtEngine = c_void;
/// Opaque `nvinfer1::IExecutionContext`.
pub type TrtContext = c_void;

extern "C" {
    /// Creates a runtime with the shim's stderr logger. Null on failure.
    pub fn trt_runtime_create() -> *mut TrtRuntime;
    pub fn trt_runtime_destroy(runtime: *mut TrtRuntime);

    /// Null when the runtime rejects the blob.
    pub fn trt_deserialize_engine(
        runtime: *mut TrtRuntime,
        blob: *const c_void,
        size: usize,
    ) -> *mut TrtEngine;
    pub fn trt_engine_destroy(engine: *mut TrtEngine);

    pub fn trt_engine_num_bindings(engine: *const TrtEngine) -> c_int;
    pub fn trt_engine_max_batch_size(engine: *const TrtEngine) -> c_int;
    /// Borrowed, null-terminated; valid as long as the engine.
    pub fn trt_engine_binding_name(engine: *const TrtEngine, index: c_int) -> *const c_char;
    pub fn trt_engine_binding_is_input(engine: *const TrtEngine, index: c_int) -> c_int;
    /// Raw `nvinfer1::DataType` value.
    pub fn trt_engine_binding_dtype(engine: *const TrtEngine, index: c_int) -> c_int;
    /// Writes up to `max_dims` dimensions, returns the rank or -1.
    pub fn trt_engine_binding_dims(
        engine: *const TrtEngine,
        index: c_int,
        dims: *mut c_int,
        max_dims: c_int,
    ) -> c_int;

    pub fn trt_context_create(engine: *mut TrtEngine) -> *mut TrtContext;
    pub fn trt_context_destroy(context: *mut TrtContext);
    /// Returns 1 when the work was enqueued.
    pub fn trt_context_enqueue(
        context: *mut TrtContext,
        batch_size: c_int,
        bindings: *const *mut c_void,
        stream: cudaStream_t,
    ) -> c_int;
}
