//! In-process reference runtime.
//!
//! Simulates a device with its own address space and executes a small
//! JSON-described engine format. It gives the wrapper a deterministic
//! runtime to run against on machines without a GPU.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    Backend, BackendKind, BindingDesc, DeviceMemory, DevicePtr, EngineHandle, ExecutionContext,
    HostMemory, Stream,
};
use crate::error::{EngineError, Result};
use crate::tensor::{DataType, Shape};

const BACKEND: &str = "reference";

/// Format tag every reference engine blob carries.
pub const REFERENCE_FORMAT: &str = "trt-runner-reference";
/// Blob version this runtime understands.
pub const REFERENCE_VERSION: u32 = 1;

const BASE_ADDRESS: DevicePtr = 0x1000_0000;
const ALIGNMENT: u64 = 256;

/// Layer executed by a reference engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReferenceOp {
    /// Output element `j` is `scale * mean(chunk j of the input) + bias`.
    MeanPool {
        #[serde(default = "default_scale")]
        scale: f32,
        #[serde(default)]
        bias: f32,
    },
}

impl Default for ReferenceOp {
    fn default() -> Self {
        ReferenceOp::MeanPool {
            scale: default_scale(),
            bias: 0.0,
        }
    }
}

fn default_scale() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceBinding {
    pub name: String,
    pub dtype: DataType,
    pub dims: Vec<usize>,
    pub input: bool,
}

/// Serialized form of a reference engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceModel {
    pub format: String,
    pub version: u32,
    pub max_batch_size: usize,
    pub bindings: Vec<ReferenceBinding>,
    #[serde(default)]
    pub op: ReferenceOp,
}

impl ReferenceModel {
    /// Single-input, single-output engine with a mean-pool layer.
    pub fn new(
        input: (DataType, impl Into<Vec<usize>>),
        output: (DataType, impl Into<Vec<usize>>),
    ) -> Self {
        Self {
            format: REFERENCE_FORMAT.to_string(),
            version: REFERENCE_VERSION,
            max_batch_size: 1,
            bindings: vec![
                ReferenceBinding {
                    name: "input".to_string(),
                    dtype: input.0,
                    dims: input.1.into(),
                    input: true,
                },
                ReferenceBinding {
                    name: "output".to_string(),
                    dtype: output.0,
                    dims: output.1.into(),
                    input: false,
                },
            ],
            op: ReferenceOp::default(),
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_op(mut self, op: ReferenceOp) -> Self {
        self.op = op;
        self
    }

    pub fn to_blob(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    fn parse(blob: &[u8]) -> Result<Self> {
        let model: ReferenceModel = serde_json::from_slice(blob)
            .map_err(|e| EngineError::Deserialization(format!("malformed reference engine: {}", e)))?;

        if model.format != REFERENCE_FORMAT {
            return Err(EngineError::Deserialization(format!(
                "unknown engine format '{}'",
                model.format
            )));
        }
        if model.version != REFERENCE_VERSION {
            return Err(EngineError::Deserialization(format!(
                "engine version {} is not supported by this runtime (expected {})",
                model.version, REFERENCE_VERSION
            )));
        }
        if model.max_batch_size == 0 {
            return Err(EngineError::Deserialization(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if !model.bindings.iter().any(|b| b.input) || !model.bindings.iter().any(|b| !b.input) {
            return Err(EngineError::Deserialization(
                "engine needs at least one input and one output".to_string(),
            ));
        }
        Ok(model)
    }

    fn first_binding(&self, input: bool) -> Option<(usize, &ReferenceBinding)> {
        self.bindings.iter().enumerate().find(|(_, b)| b.input == input)
    }
}

/// Simulated device address space shared by every handle of one backend.
#[derive(Debug, Default)]
struct AddressSpace {
    next: DevicePtr,
    allocations: BTreeMap<DevicePtr, Vec<u8>>,
}

impl AddressSpace {
    fn alloc(&mut self, len: usize) -> DevicePtr {
        if self.next == 0 {
            self.next = BASE_ADDRESS;
        }
        let ptr = self.next;
        let span = (len as u64).max(1);
        self.next += span.div_ceil(ALIGNMENT) * ALIGNMENT;
        self.allocations.insert(ptr, vec![0; len]);
        ptr
    }

    fn free(&mut self, ptr: DevicePtr) {
        self.allocations.remove(&ptr);
    }

    /// Locates `[ptr, ptr + len)` inside a live allocation.
    fn locate(&mut self, ptr: DevicePtr, len: usize) -> Result<(&mut Vec<u8>, usize)> {
        let (base, bytes) = self
            .allocations
            .range_mut(..=ptr)
            .next_back()
            .ok_or_else(|| out_of_range(ptr, len))?;
        let offset = (ptr - *base) as usize;
        if offset + len > bytes.len() {
            return Err(out_of_range(ptr, len));
        }
        Ok((bytes, offset))
    }

    fn read(&mut self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        let (bytes, offset) = self.locate(ptr, len)?;
        Ok(bytes[offset..offset + len].to_vec())
    }

    fn write(&mut self, ptr: DevicePtr, src: &[u8]) -> Result<()> {
        let (bytes, offset) = self.locate(ptr, src.len())?;
        bytes[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}

fn out_of_range(ptr: DevicePtr, len: usize) -> EngineError {
    EngineError::runtime(
        BACKEND,
        "memory access",
        format!("{} bytes at {:#x} fall outside any allocation", len, ptr),
    )
}

/// Failures a reference backend injects on purpose. Attempts are counted
/// from zero over the backend's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Fail the enqueue with this attempt number.
    pub fail_enqueue: Option<u64>,
    /// Fail the device allocation with this attempt number.
    pub fail_alloc_device: Option<u64>,
}

#[derive(Debug, Default)]
struct Device {
    memory: Mutex<AddressSpace>,
    faults: FaultPlan,
    ops: AtomicU64,
    syncs: AtomicU64,
    enqueues: AtomicU64,
    device_allocs: AtomicU64,
    live_contexts: AtomicUsize,
    bound_thread: Mutex<Option<ThreadId>>,
}

impl Device {
    fn record_op(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an attempt and reports whether the plan says it must fail.
    fn attempt(counter: &AtomicU64, fail_at: Option<u64>) -> bool {
        let attempt = counter.fetch_add(1, Ordering::Relaxed);
        fail_at == Some(attempt)
    }
}

/// Host reference runtime.
#[derive(Debug, Clone, Default)]
pub struct ReferenceBackend {
    device: Arc<Device>,
}

impl ReferenceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend whose device fails the operations named in `faults`.
    pub fn with_faults(faults: FaultPlan) -> Self {
        Self {
            device: Arc::new(Device {
                faults,
                ..Device::default()
            }),
        }
    }

    /// Number of copies and executions issued against the simulated device.
    pub fn device_ops(&self) -> u64 {
        self.device.ops.load(Ordering::Relaxed)
    }

    /// Number of live device allocations.
    pub fn live_allocations(&self) -> usize {
        self.device.memory.lock().allocations.len()
    }

    /// Device allocations requested so far, failed ones included.
    pub fn device_alloc_attempts(&self) -> u64 {
        self.device.device_allocs.load(Ordering::Relaxed)
    }

    /// Number of stream synchronizations.
    pub fn syncs(&self) -> u64 {
        self.device.syncs.load(Ordering::Relaxed)
    }

    /// Execution contexts that have not been dropped yet.
    pub fn live_contexts(&self) -> usize {
        self.device.live_contexts.load(Ordering::Relaxed)
    }

    /// Thread that most recently made this device current.
    pub fn bound_thread(&self) -> Option<ThreadId> {
        *self.device.bound_thread.lock()
    }
}

impl Backend for ReferenceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Reference
    }

    fn name(&self) -> &'static str {
        BACKEND
    }

    fn bind_thread(&self) -> Result<()> {
        *self.device.bound_thread.lock() = Some(thread::current().id());
        Ok(())
    }

    fn deserialize_engine(&self, blob: &[u8]) -> Result<Box<dyn EngineHandle>> {
        let model = ReferenceModel::parse(blob)?;
        debug!(
            bindings = model.bindings.len(),
            max_batch_size = model.max_batch_size,
            "deserialized reference engine"
        );
        Ok(Box::new(ReferenceEngine {
            model,
            device: self.device.clone(),
        }))
    }

    fn alloc_host(&self, len: usize) -> Result<Box<dyn HostMemory>> {
        Ok(Box::new(HostBuffer(vec![0; len])))
    }

    fn alloc_device(&self, len: usize) -> Result<Box<dyn DeviceMemory>> {
        if Device::attempt(&self.device.device_allocs, self.device.faults.fail_alloc_device) {
            return Err(EngineError::runtime(
                BACKEND,
                "alloc_device",
                format!("injected failure allocating {} bytes", len),
            ));
        }
        let ptr = self.device.memory.lock().alloc(len);
        Ok(Box::new(DeviceBuffer {
            device: self.device.clone(),
            ptr,
            len,
        }))
    }

    fn create_stream(&self) -> Result<Box<dyn Stream>> {
        Ok(Box::new(ReferenceStream {
            device: self.device.clone(),
        }))
    }

    fn copy_to_device(&self, dst: &dyn DeviceMemory, src: &[u8]) -> Result<()> {
        check_fits(src.len(), dst.len())?;
        self.device.record_op();
        self.device.memory.lock().write(dst.ptr(), src)
    }

    fn copy_from_device(&self, dst: &mut [u8], src: &dyn DeviceMemory) -> Result<()> {
        check_fits(dst.len(), src.len())?;
        self.device.record_op();
        let bytes = self.device.memory.lock().read(src.ptr(), dst.len())?;
        dst.copy_from_slice(&bytes);
        Ok(())
    }
}

fn check_fits(len: usize, capacity: usize) -> Result<()> {
    if len > capacity {
        return Err(EngineError::runtime(
            BACKEND,
            "memcpy",
            format!("copy of {} bytes exceeds allocation of {} bytes", len, capacity),
        ));
    }
    Ok(())
}

struct HostBuffer(Vec<u8>);

impl HostMemory for HostBuffer {
    fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

struct DeviceBuffer {
    device: Arc<Device>,
    ptr: DevicePtr,
    len: usize,
}

impl DeviceMemory for DeviceBuffer {
    fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.device.memory.lock().free(self.ptr);
    }
}

/// Operations complete as soon as they are issued.
struct ReferenceStream {
    device: Arc<Device>,
}

impl Stream for ReferenceStream {
    fn copy_htod(&self, dst: &dyn DeviceMemory, src: &dyn HostMemory) -> Result<()> {
        check_fits(src.len(), dst.len())?;
        self.device.record_op();
        self.device.memory.lock().write(dst.ptr(), src.as_bytes())
    }

    fn copy_dtoh(&self, dst: &mut dyn HostMemory, src: &dyn DeviceMemory) -> Result<()> {
        check_fits(dst.len(), src.len())?;
        self.device.record_op();
        let bytes = self.device.memory.lock().read(src.ptr(), dst.len())?;
        dst.as_bytes_mut().copy_from_slice(&bytes);
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        self.device.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct ReferenceEngine {
    model: ReferenceModel,
    device: Arc<Device>,
}

impl EngineHandle for ReferenceEngine {
    fn num_bindings(&self) -> usize {
        self.model.bindings.len()
    }

    fn binding(&self, index: usize) -> Result<BindingDesc> {
        let binding = self.model.bindings.get(index).ok_or_else(|| {
            EngineError::runtime(BACKEND, "binding", format!("no binding at index {}", index))
        })?;
        Ok(BindingDesc {
            name: binding.name.clone(),
            is_input: binding.input,
            dtype: binding.dtype,
            shape: Shape::new(binding.dims.clone()),
        })
    }

    fn max_batch_size(&self) -> usize {
        self.model.max_batch_size
    }

    fn create_context(&self) -> Result<Box<dyn ExecutionContext + '_>> {
        self.device.live_contexts.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(ReferenceContext { engine: self }))
    }
}

struct ReferenceContext<'e> {
    engine: &'e ReferenceEngine,
}

impl Drop for ReferenceContext<'_> {
    fn drop(&mut self) {
        self.engine.device.live_contexts.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ExecutionContext for ReferenceContext<'_> {
    fn enqueue(&mut self, batch_size: usize, bindings: &[DevicePtr], _stream: &dyn Stream) -> Result<()> {
        let model = &self.engine.model;
        let device = &self.engine.device;
        if Device::attempt(&device.enqueues, device.faults.fail_enqueue) {
            return Err(EngineError::runtime(BACKEND, "enqueue", "injected launch failure"));
        }
        if batch_size == 0 || batch_size > model.max_batch_size {
            return Err(EngineError::runtime(
                BACKEND,
                "enqueue",
                format!(
                    "batch size {} outside 1..={}",
                    batch_size, model.max_batch_size
                ),
            ));
        }
        if bindings.len() != model.bindings.len() {
            return Err(EngineError::runtime(
                BACKEND,
                "enqueue",
                format!(
                    "expected {} binding pointers, got {}",
                    model.bindings.len(),
                    bindings.len()
                ),
            ));
        }

        // parse() guarantees both exist
        let (in_index, input) = model
            .first_binding(true)
            .ok_or_else(|| EngineError::runtime(BACKEND, "enqueue", "no input binding"))?;
        let (out_index, output) = model
            .first_binding(false)
            .ok_or_else(|| EngineError::runtime(BACKEND, "enqueue", "no output binding"))?;

        let in_volume: usize = input.dims.iter().product();
        let out_volume: usize = output.dims.iter().product();

        device.record_op();
        let mut memory = device.memory.lock();
        let raw = memory.read(bindings[in_index], batch_size * in_volume * input.dtype.size())?;
        let values = input.dtype.decode(&raw);

        let mut result = Vec::with_capacity(batch_size * out_volume);
        for sample in values.chunks(in_volume.max(1)).take(batch_size) {
            apply(model.op, sample, out_volume, &mut result);
        }

        let mut encoded = Vec::new();
        output.dtype.encode_into(&result, &mut encoded);
        memory.write(bindings[out_index], &encoded)
    }
}

fn apply(op: ReferenceOp, input: &[f32], out_len: usize, out: &mut Vec<f32>) {
    match op {
        ReferenceOp::MeanPool { scale, bias } => {
            let in_len = input.len();
            for j in 0..out_len {
                let start = j * in_len / out_len;
                let end = ((j + 1) * in_len / out_len).max(start + 1).min(in_len);
                let mean = if start < end {
                    input[start..end].iter().sum::<f32>() / (end - start) as f32
                } else {
                    0.0
                };
                out.push(scale * mean + bias);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_foreign_and_future_blobs() {
        let backend = ReferenceBackend::new();
        let err = backend.deserialize_engine(b"\x00\x01not json").err().unwrap();
        assert!(matches!(err, EngineError::Deserialization(_)));

        let mut model = ReferenceModel::new((DataType::Float, vec![4]), (DataType::Float, vec![2]));
        model.version = 7;
        let err = backend.deserialize_engine(&model.to_blob().unwrap()).err().unwrap();
        assert!(err.to_string().contains("version 7"));

        model.version = REFERENCE_VERSION;
        model.format = "onnx".to_string();
        assert!(backend.deserialize_engine(&model.to_blob().unwrap()).is_err());
    }

    #[test]
    fn blob_parses_back_to_the_same_model() {
        let model = ReferenceModel::new((DataType::Half, vec![3, 8]), (DataType::Float, vec![4]))
            .with_max_batch_size(3)
            .with_op(ReferenceOp::MeanPool { scale: 0.5, bias: -1.0 });
        let blob = model.to_blob().unwrap();
        assert!(!blob.is_empty());
        assert_eq!(ReferenceModel::parse(&blob).unwrap(), model);
    }

    #[test]
    fn op_defaults_when_missing() {
        let json = r#"{
            "format": "trt-runner-reference",
            "version": 1,
            "max_batch_size": 2,
            "bindings": [
                {"name": "x", "dtype": "float", "dims": [4], "input": true},
                {"name": "y", "dtype": "half", "dims": [2], "input": false}
            ]
        }"#;
        let engine = ReferenceBackend::new().deserialize_engine(json.as_bytes()).unwrap();
        assert_eq!(engine.max_batch_size(), 2);
        let out = engine.binding(1).unwrap();
        assert_eq!(out.dtype, DataType::Half);
        assert!(!out.is_input);
    }

    #[test]
    fn address_space_supports_offsets() {
        let mut space = AddressSpace::default();
        let a = space.alloc(16);
        let b = space.alloc(8);
        assert_ne!(a, b);
        space.write(a + 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(space.read(a + 4, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(space.read(a + 14, 4).is_err());
        space.free(b);
        assert!(space.read(b, 1).is_err());
    }

    #[test]
    fn device_memory_released_on_drop() {
        let backend = ReferenceBackend::new();
        let buf = backend.alloc_device(64).unwrap();
        assert_eq!(backend.live_allocations(), 1);
        drop(buf);
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn injected_allocation_failure_hits_only_the_planned_attempt() {
        let backend = ReferenceBackend::with_faults(FaultPlan {
            fail_alloc_device: Some(1),
            ..FaultPlan::default()
        });
        let first = backend.alloc_device(8).unwrap();
        let err = backend.alloc_device(8).err().unwrap();
        assert!(matches!(err, EngineError::Runtime { op: "alloc_device", .. }));
        let third = backend.alloc_device(8).unwrap();
        assert_eq!(backend.device_alloc_attempts(), 3);
        assert_eq!(backend.live_allocations(), 2);
        drop((first, third));
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn contexts_are_counted_until_dropped() {
        let backend = ReferenceBackend::new();
        let model = ReferenceModel::new((DataType::Float, vec![2]), (DataType::Float, vec![1]));
        let engine = backend.deserialize_engine(&model.to_blob().unwrap()).unwrap();
        let context = engine.create_context().unwrap();
        assert_eq!(backend.live_contexts(), 1);
        drop(context);
        assert_eq!(backend.live_contexts(), 0);
    }

    #[test]
    fn mean_pool_buckets_input() {
        let mut out = Vec::new();
        apply(
            ReferenceOp::MeanPool { scale: 2.0, bias: 1.0 },
            &[1.0, 3.0, 5.0, 7.0],
            2,
            &mut out,
        );
        assert_eq!(out, vec![5.0, 13.0]);
    }

    #[test]
    fn enqueue_executes_every_sample_in_the_batch() {
        let backend = ReferenceBackend::new();
        let model = ReferenceModel::new((DataType::Float, vec![2]), (DataType::Float, vec![1]))
            .with_max_batch_size(2);
        let engine = backend.deserialize_engine(&model.to_blob().unwrap()).unwrap();
        let d_in = backend.alloc_device(16).unwrap();
        let d_out = backend.alloc_device(8).unwrap();
        let stream = backend.create_stream().unwrap();

        let mut input = Vec::new();
        DataType::Float.encode_into(&[1.0, 3.0, 10.0, 20.0], &mut input);
        backend.copy_to_device(d_in.as_ref(), &input).unwrap();

        let mut context = engine.create_context().unwrap();
        context.enqueue(2, &[d_in.ptr(), d_out.ptr()], stream.as_ref()).unwrap();
        assert!(context.enqueue(3, &[d_in.ptr(), d_out.ptr()], stream.as_ref()).is_err());

        let mut output = vec![0u8; 8];
        backend.copy_from_device(&mut output, d_out.as_ref()).unwrap();
        assert_eq!(DataType::Float.decode(&output), vec![2.0, 15.0]);
    }
}
