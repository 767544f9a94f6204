mod common;

use std::sync::Arc;

use trt_runner::{Backend, DataType, DeviceTensor, EngineError, FaultPlan, ReferenceBackend};

use common::{classifier, open, open_on, ramp_batch};

#[test]
fn device_path_strides_by_max_batch_size() {
    let (backend, mut engine, _dir) = open(&classifier(4));
    let batch = ramp_batch(DataType::Half, &[3, 32, 32], 8);
    let input = DeviceTensor::upload(engine.backend(), &batch).unwrap();
    let before = backend.device_ops();

    let output = engine.run_on_device(&input).unwrap();

    // Two strides of four samples, no host staging
    assert_eq!(backend.device_ops() - before, 2);
    assert_eq!(output.shape().dims(), &[8, 10]);
    assert_eq!(output.dtype(), DataType::Half);
}

#[test]
fn device_path_agrees_with_per_sample_path() {
    let (_backend, mut engine, _dir) = open(&classifier(2));
    let batch = ramp_batch(DataType::Half, &[3, 32, 32], 6);

    let expected = engine.run(&batch).unwrap();
    let input = DeviceTensor::upload(engine.backend(), &batch).unwrap();
    let actual = engine.run_on_device(&input).unwrap().download().unwrap();

    assert_eq!(actual, expected);
}

#[test]
fn indivisible_batch_rejected_before_device_work() {
    let (backend, mut engine, _dir) = open(&classifier(4));
    let batch = ramp_batch(DataType::Half, &[3, 32, 32], 6);
    let input = DeviceTensor::upload(engine.backend(), &batch).unwrap();
    let before = backend.device_ops();
    let allocations = backend.live_allocations();

    let err = engine.run_on_device(&input).unwrap_err();

    assert!(matches!(err, EngineError::Precondition(_)), "{}", err);
    assert_eq!(backend.device_ops(), before);
    assert_eq!(backend.live_allocations(), allocations);
}

#[test]
fn device_path_validates_shape() {
    let (backend, mut engine, _dir) = open(&classifier(2));
    let batch = ramp_batch(DataType::Half, &[3, 16, 16], 2);
    let input = DeviceTensor::upload(engine.backend(), &batch).unwrap();
    let before = backend.device_ops();

    let err = engine.run_on_device(&input).unwrap_err();

    assert!(matches!(err, EngineError::InputMismatch { .. }), "{}", err);
    assert_eq!(backend.device_ops(), before);
}

#[test]
fn device_outputs_are_freed_on_drop() {
    let (backend, mut engine, _dir) = open(&classifier(2));
    let batch = ramp_batch(DataType::Half, &[3, 32, 32], 2);
    let input = DeviceTensor::upload(engine.backend(), &batch).unwrap();
    let baseline = backend.live_allocations();

    let output = engine.run_on_device(&input).unwrap();
    assert_eq!(backend.live_allocations(), baseline + 1);

    drop(output);
    assert_eq!(backend.live_allocations(), baseline);
}

#[test]
fn tensor_from_another_backend_is_rejected() {
    let (backend, mut engine, _dir) = open(&classifier(2));
    let batch = ramp_batch(DataType::Half, &[3, 32, 32], 2);
    // Leave recognizable results in the engine's staging buffers
    engine.run(&batch).unwrap();

    let foreign: Arc<dyn Backend> = Arc::new(ReferenceBackend::new());
    let input = DeviceTensor::upload(&foreign, &batch).unwrap();
    let before = backend.device_ops();
    let allocations = backend.live_allocations();

    let err = engine.run_on_device(&input).unwrap_err();

    assert!(matches!(err, EngineError::Precondition(_)), "{}", err);
    assert_eq!(backend.device_ops(), before);
    assert_eq!(backend.live_allocations(), allocations);
}

#[test]
fn failed_stride_still_drains_the_stream() {
    let faults = FaultPlan {
        fail_enqueue: Some(1),
        ..FaultPlan::default()
    };
    let (backend, mut engine, _dir) = open_on(ReferenceBackend::with_faults(faults), &classifier(2));
    let batch = ramp_batch(DataType::Half, &[3, 32, 32], 4);
    let input = DeviceTensor::upload(engine.backend(), &batch).unwrap();
    let allocations = backend.live_allocations();
    let syncs = backend.syncs();

    let err = engine.run_on_device(&input).unwrap_err();

    assert!(matches!(err, EngineError::Runtime { op: "enqueue", .. }), "{}", err);
    assert_eq!(backend.syncs(), syncs + 1);
    assert_eq!(backend.live_contexts(), 0);
    // The output tensor allocated for the failed call is gone too
    assert_eq!(backend.live_allocations(), allocations);
}
