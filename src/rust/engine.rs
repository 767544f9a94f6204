use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BindingDesc, DeviceMemory, EngineHandle, ExecutionContext, HostMemory, Stream,
};
use crate::device::DeviceTensor;
use crate::error::{EngineError, Result};
use crate::tensor::{DataType, Shape, Tensor};

/// Host and device buffers for one sample, plus the stream that moves data
/// between them. Every compute call overwrites all four buffers.
struct Staging {
    stream: Box<dyn Stream>,
    h_input: Box<dyn HostMemory>,
    h_output: Box<dyn HostMemory>,
    d_input: Box<dyn DeviceMemory>,
    d_output: Box<dyn DeviceMemory>,
}

impl Staging {
    fn new(backend: &dyn Backend, input: &BindingDesc, output: &BindingDesc) -> Result<Self> {
        let h_input = backend.alloc_host(input.byte_size())?;
        let h_output = backend.alloc_host(output.byte_size())?;
        let d_input = backend.alloc_device(h_input.len())?;
        let d_output = backend.alloc_device(h_output.len())?;
        let stream = backend.create_stream()?;
        Ok(Self {
            stream,
            h_input,
            h_output,
            d_input,
            d_output,
        })
    }

    /// Pushes one sample through the engine and leaves the result in `h_output`.
    fn round_trip(&mut self, sample: &[u8], context: &mut (dyn ExecutionContext + '_)) -> Result<()> {
        self.h_input.as_bytes_mut().copy_from_slice(sample);

        let bindings = [self.d_input.ptr(), self.d_output.ptr()];
        let queued = self
            .stream
            .copy_htod(self.d_input.as_ref(), self.h_input.as_ref())
            .and_then(|()| context.enqueue(1, &bindings, self.stream.as_ref()))
            .and_then(|()| self.stream.copy_dtoh(self.h_output.as_mut(), self.d_output.as_ref()));
        settle(self.stream.as_ref(), queued)
    }
}

/// Drains `stream` whether or not queueing succeeded, then reports the first
/// failure. Nothing queued may still be running once the context or the
/// staging buffers are touched again.
fn settle(stream: &dyn Stream, queued: Result<()>) -> Result<()> {
    let synced = stream.synchronize();
    match queued {
        Ok(()) => synced,
        Err(err) => {
            if let Err(sync_err) = synced {
                warn!("stream synchronize after failed launch also failed: {}", sync_err);
            }
            Err(err)
        }
    }
}

/// Serializable description of a loaded engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub input: BindingDesc,
    pub output: BindingDesc,
    pub max_batch_size: usize,
}

/// A deserialized inference engine together with the buffers needed to run it.
///
/// Inference takes `&mut self`: the staging buffers are shared by every call,
/// so one `Engine` serves one caller at a time. Wrap it in a lock to share it.
pub struct Engine {
    // Field order is drop order: buffers and stream go before the engine.
    staging: Staging,
    engine: Box<dyn EngineHandle>,
    input: BindingDesc,
    output: BindingDesc,
    max_batch_size: usize,
    path: Option<PathBuf>,
    backend: Arc<dyn Backend>,
}

impl Engine {
    /// Loads a serialized engine from disk.
    pub fn open(backend: Arc<dyn Backend>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EngineError::NotFound(path.to_path_buf()));
        }
        let blob = fs::read(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut engine = Self::from_blob(backend, &blob)?;
        engine.path = Some(path.to_path_buf());
        info!(
            "Loaded {} engine from {} ({} bytes)",
            engine.backend.name(),
            path.display(),
            blob.len()
        );
        Ok(engine)
    }

    /// Deserializes an engine from an in-memory blob.
    pub fn from_blob(backend: Arc<dyn Backend>, blob: &[u8]) -> Result<Self> {
        backend.initialize()?;

        let engine = backend.deserialize_engine(blob)?;
        let (input, output) = read_bindings(engine.as_ref())?;
        let staging = Staging::new(backend.as_ref(), &input, &output)?;
        let max_batch_size = engine.max_batch_size();

        debug!(
            input = %input.signature(),
            output = %output.signature(),
            max_batch_size,
            "engine ready"
        );

        Ok(Self {
            staging,
            engine,
            input,
            output,
            max_batch_size,
            path: None,
            backend,
        })
    }

    pub fn input(&self) -> &BindingDesc {
        &self.input
    }

    pub fn output(&self) -> &BindingDesc {
        &self.output
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn summary(&self) -> EngineSummary {
        EngineSummary {
            backend: self.backend.name().to_string(),
            path: self.path.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            max_batch_size: self.max_batch_size,
        }
    }

    /// Runs a single sample shaped exactly like the input binding.
    pub fn compute(&mut self, sample: &Tensor) -> Result<Tensor> {
        if sample.dtype() != self.input.dtype || sample.shape() != &self.input.shape {
            return Err(EngineError::mismatch(self.input.signature(), sample.signature()));
        }

        self.backend.bind_thread()?;
        let mut context = self.engine.create_context()?;
        self.staging.round_trip(sample.as_bytes(), context.as_mut())?;
        Tensor::from_bytes(
            self.output.dtype,
            self.output.shape.clone(),
            self.staging.h_output.as_bytes().to_vec(),
        )
    }

    /// Runs every sample of `batch` in order, one device round trip each.
    ///
    /// The leading dimension of `batch` is the sample count; it does not need
    /// to relate to the engine's max batch size. The result has shape
    /// `[n, output...]`.
    pub fn run(&mut self, batch: &Tensor) -> Result<Tensor> {
        let n = self.check_batch(batch.dtype(), batch.shape())?;
        let out_shape = self.output.shape.batched(n);
        if n == 0 {
            return Ok(Tensor::zeros(self.output.dtype, out_shape));
        }

        self.backend.bind_thread()?;
        let started = Instant::now();
        let mut data = Vec::with_capacity(n * self.output.byte_size());
        let mut context = self.engine.create_context()?;
        for i in 0..n {
            let sample = batch
                .sample_bytes(i)
                .ok_or_else(|| EngineError::Precondition(format!("sample {} out of range", i)))?;
            self.staging.round_trip(sample, context.as_mut())?;
            data.extend_from_slice(self.staging.h_output.as_bytes());
        }
        drop(context);

        debug!(
            samples = n,
            elapsed_ms = started.elapsed().as_secs_f64() * 1e3,
            "batch complete"
        );
        Tensor::from_bytes(self.output.dtype, out_shape, data)
    }

    /// Runs a device-resident batch in strides of the engine's max batch size.
    ///
    /// Device pointers go straight to the runtime without host staging. The
    /// input must have been allocated through this engine's backend, and the
    /// sample count must be a multiple of `max_batch_size`. Everything is
    /// checked before any device work.
    pub fn run_on_device(&mut self, input: &DeviceTensor) -> Result<DeviceTensor> {
        if !Arc::ptr_eq(input.backend(), &self.backend) {
            return Err(EngineError::Precondition(format!(
                "device tensor was allocated by another {} backend instance",
                input.backend().name()
            )));
        }
        let n = self.check_batch(input.dtype(), input.shape())?;
        if n % self.max_batch_size != 0 {
            return Err(EngineError::Precondition(format!(
                "batch of {} samples is not a multiple of the engine's max batch size {}",
                n, self.max_batch_size
            )));
        }

        let output = DeviceTensor::alloc(&self.backend, self.output.dtype, self.output.shape.batched(n))?;
        if n == 0 {
            return Ok(output);
        }

        let started = Instant::now();
        let stride = self.max_batch_size;
        let in_step = (stride * self.input.byte_size()) as u64;
        let out_step = (stride * self.output.byte_size()) as u64;

        let stream = self.staging.stream.as_ref();
        let mut context = self.engine.create_context()?;
        let queued = (0..(n / stride) as u64).try_for_each(|step| {
            let bindings = [input.ptr() + step * in_step, output.ptr() + step * out_step];
            context.enqueue(stride, &bindings, stream)
        });
        settle(stream, queued)?;
        drop(context);

        debug!(
            samples = n,
            stride,
            elapsed_ms = started.elapsed().as_secs_f64() * 1e3,
            "device batch complete"
        );
        Ok(output)
    }

    /// Returns the sample count of a batch that matches the input binding.
    fn check_batch(&self, dtype: DataType, shape: &Shape) -> Result<usize> {
        let expected = || format!("{}[Nx{}]", self.input.dtype, self.input.shape);
        let actual = || format!("{}[{}]", dtype, shape);

        if dtype != self.input.dtype {
            return Err(EngineError::mismatch(expected(), actual()));
        }
        match shape.split_batch() {
            Some((n, rest)) if rest == self.input.shape => Ok(n),
            _ => Err(EngineError::mismatch(expected(), actual())),
        }
    }
}

/// Binding 0 must be the input and binding 1 the output; nothing else.
fn read_bindings(engine: &dyn EngineHandle) -> Result<(BindingDesc, BindingDesc)> {
    let count = engine.num_bindings();
    if count != 2 {
        return Err(EngineError::BindingLayout(format!(
            "expected 2 bindings (one input, one output), engine declares {}",
            count
        )));
    }

    let input = engine.binding(0)?;
    if !input.is_input {
        return Err(EngineError::BindingLayout(format!(
            "binding 0 ('{}') is not an input",
            input.name
        )));
    }
    let output = engine.binding(1)?;
    if output.is_input {
        return Err(EngineError::BindingLayout(format!(
            "binding 1 ('{}') is not an output",
            output.name
        )));
    }
    Ok((input, output))
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Buffers and stream are released against the engine's device
        if let Err(err) = self.backend.bind_thread() {
            warn!("failed to bind device while releasing engine: {}", err);
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} engine", self.backend.name())?;
        writeln!(
            f,
            "input  -> shape:{}\tdtype:{}",
            self.input.shape, self.input.dtype
        )?;
        writeln!(
            f,
            "output -> shape:{}\tdtype:{}",
            self.output.shape, self.output.dtype
        )?;
        write!(f, "batch size:{}", self.max_batch_size)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.backend.name())
            .field("path", &self.path)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("max_batch_size", &self.max_batch_size)
            .finish()
    }
}
