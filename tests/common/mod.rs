#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use trt_runner::backend::reference::ReferenceOp;
use trt_runner::{Backend, DataType, Engine, ReferenceBackend, ReferenceModel, Tensor};

/// Classifier-shaped engine: half 3x32x32 in, half 10 out.
pub fn classifier(max_batch_size: usize) -> ReferenceModel {
    ReferenceModel::new((DataType::Half, vec![3, 32, 32]), (DataType::Half, vec![10]))
        .with_max_batch_size(max_batch_size)
        .with_op(ReferenceOp::MeanPool { scale: 2.0, bias: 0.5 })
}

/// Writes `blob` to a fresh temp dir and returns the file path.
pub fn write_engine(blob: &[u8]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.trt");
    std::fs::write(&path, blob).unwrap();
    (dir, path)
}

pub fn open(model: &ReferenceModel) -> (ReferenceBackend, Engine, TempDir) {
    open_on(ReferenceBackend::new(), model)
}

/// Like `open`, on a backend the caller prepared (for example with faults).
pub fn open_on(backend: ReferenceBackend, model: &ReferenceModel) -> (ReferenceBackend, Engine, TempDir) {
    let (dir, path) = write_engine(&model.to_blob().unwrap());
    let shared: Arc<dyn Backend> = Arc::new(backend.clone());
    let engine = Engine::open(shared, &path).unwrap();
    (backend, engine, dir)
}

/// Deterministic batch where every sample differs.
pub fn ramp_batch(dtype: DataType, sample_dims: &[usize], n: usize) -> Tensor {
    let mut dims = vec![n];
    dims.extend_from_slice(sample_dims);
    let per_sample: usize = sample_dims.iter().product();
    let values: Vec<f32> = (0..n * per_sample)
        .map(|i| {
            let sample = (i / per_sample) as f32;
            let offset = (i % per_sample) as f32 / per_sample as f32;
            sample * 0.25 + offset * 0.125
        })
        .collect();
    Tensor::from_f32(dtype, dims, &values).unwrap()
}
