//! End-to-end forward passes through the two-layer model.

use std::path::Path;
use std::sync::Arc;

use fcnn_offload::errors::PipelineError;
use fcnn_offload::fcnn::{HIDDEN_SIZE, INPUT_SIZE, NUM_CLASSES};
use fcnn_offload::weights::write_npy;
use fcnn_offload::{
    ContextConfig, EventStatus, ExecutionContext, Fcnn, FcnnWeights, KernelPackage, TensorBuffer,
};

const TOLERANCE: f32 = 1e-5;

fn shared_context() -> Arc<ExecutionContext> {
    Arc::new(
        ExecutionContext::initialize(&KernelPackage::host_emulated())
            .expect("context should initialize"),
    )
}

fn bound_input(context: &ExecutionContext, rows: usize, value: f32) -> TensorBuffer {
    let mut input = TensorBuffer::constant(rows, INPUT_SIZE, value);
    input.bind_to_device(context, None).expect("bind");
    input
}

#[test]
fn test_constant_model_outputs_uniform_probabilities() {
    let context = shared_context();
    let model = Fcnn::with_constant_weights(Arc::clone(&context)).expect("model");
    let input = bound_input(&context, 1, 1.0);

    let (mut output, done) = model.forward_after(&input, &[]).expect("forward");
    assert_eq!(output.shape(), (1, NUM_CLASSES));
    output
        .copy_to_host_after(&context, &[done])
        .expect("readback");
    context.drain().expect("drain");

    for value in output.to_vec() {
        assert!((value - 0.1).abs() < TOLERANCE, "probability {value}");
    }
}

#[test]
fn test_forward_chains_without_host_synchronization() {
    let context = shared_context();
    let model = Fcnn::with_constant_weights(Arc::clone(&context)).expect("model");
    let input = bound_input(&context, 4, 1.0);

    // Nothing has been drained: weight and input migrations may still be in flight.
    let pass = model.forward_traced(&input, &[]).expect("forward");
    pass.completion().wait().expect("final stage");
    for (stage, event) in &pass.stages {
        assert_eq!(event.status(), EventStatus::Complete, "stage {}", stage.name());
    }
    context.drain().expect("drain");
}

#[test]
fn test_forward_rejects_wrong_input_width() {
    let context = shared_context();
    let model = Fcnn::with_constant_weights(Arc::clone(&context)).expect("model");
    let mut input = TensorBuffer::constant(1, INPUT_SIZE - 1, 1.0);
    input.bind_to_device(&context, None).expect("bind");

    assert!(matches!(
        model.forward(&input),
        Err(PipelineError::ShapeMismatch { .. })
    ));
    context.drain().expect("drain");
}

#[test]
fn test_forward_requires_bound_input() {
    let context = shared_context();
    let model = Fcnn::with_constant_weights(Arc::clone(&context)).expect("model");
    let input = TensorBuffer::constant(1, INPUT_SIZE, 1.0);
    assert!(matches!(
        model.forward(&input),
        Err(PipelineError::NotOnDevice { .. })
    ));
    context.drain().expect("drain");
}

#[test]
fn test_predict_with_constant_weights_picks_first_class() {
    let context = shared_context();
    let model = Fcnn::with_constant_weights(Arc::clone(&context)).expect("model");
    let input = bound_input(&context, 3, 0.5);
    // All probabilities tie, so the first index wins.
    assert_eq!(model.predict(&input).expect("predict"), vec![0, 0, 0]);
}

#[test]
fn test_repeated_forward_passes_are_deterministic() {
    let context = shared_context();
    let model = Fcnn::with_constant_weights(Arc::clone(&context)).expect("model");
    let input = bound_input(&context, 2, 0.25);

    let mut results = Vec::new();
    for _ in 0..3 {
        let (mut output, done) = model.forward_after(&input, &[]).expect("forward");
        output
            .copy_to_host_after(&context, &[done])
            .expect("readback");
        results.push(output);
    }
    context.drain().expect("drain");

    let first = results[0].to_vec();
    for output in &results[1..] {
        assert_eq!(output.to_vec(), first);
    }
}

fn write_layer_files(dir: &Path, num_classes: usize) {
    let mut w1 = vec![0.0f32; INPUT_SIZE * HIDDEN_SIZE];
    // Hidden unit h only sees input feature h.
    for h in 0..HIDDEN_SIZE {
        w1[h * HIDDEN_SIZE + h] = 1.0;
    }
    let b1 = vec![0.0f32; HIDDEN_SIZE];
    let mut w2 = vec![0.0f32; HIDDEN_SIZE * num_classes];
    // Class c is driven by hidden unit c.
    for c in 0..num_classes {
        w2[c * num_classes + c] = 1.0;
    }
    let b2 = vec![0.0f32; num_classes];

    write_npy(dir.join("w1.npy"), INPUT_SIZE, HIDDEN_SIZE, &w1).expect("w1");
    write_npy(dir.join("b1.npy"), 1, HIDDEN_SIZE, &b1).expect("b1");
    write_npy(dir.join("w2.npy"), HIDDEN_SIZE, num_classes, &w2).expect("w2");
    write_npy(dir.join("b2.npy"), 1, num_classes, &b2).expect("b2");
}

#[test]
fn test_model_from_directory_predicts_hot_feature() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_layer_files(dir.path(), NUM_CLASSES);

    let mut samples = vec![0.0f32; 3 * INPUT_SIZE];
    samples[7] = 2.0;
    samples[INPUT_SIZE + 2] = 3.0;
    samples[2 * INPUT_SIZE + 9] = 1.0;
    write_npy(dir.path().join("samples.npy"), 3, INPUT_SIZE, &samples).expect("samples");

    let context = shared_context();
    let model = Fcnn::from_directory(Arc::clone(&context), dir.path()).expect("model");
    assert_eq!(model.num_classes(), NUM_CLASSES);

    let mut input = TensorBuffer::from_npy(dir.path().join("samples.npy")).expect("samples");
    input.bind_to_device(&context, None).expect("bind");
    assert_eq!(model.predict(&input).expect("predict"), vec![7, 2, 9]);
}

#[test]
fn test_model_from_directory_with_missing_file_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_layer_files(dir.path(), NUM_CLASSES);
    std::fs::remove_file(dir.path().join("b2.npy")).expect("remove");

    assert!(matches!(
        FcnnWeights::from_directory(dir.path()),
        Err(PipelineError::Format(_))
    ));
}

#[test]
fn test_model_with_mismatched_layers_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_layer_files(dir.path(), NUM_CLASSES);
    write_npy(dir.path().join("b2.npy"), 1, 4, &[0.0; 4]).expect("b2");

    let context = shared_context();
    assert!(matches!(
        Fcnn::from_directory(context, dir.path()),
        Err(PipelineError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_single_compute_unit_produces_same_output() {
    let config = ContextConfig::new().with_compute_units(1);
    let context = Arc::new(
        ExecutionContext::with_config(&KernelPackage::host_emulated(), &config).expect("context"),
    );
    let model = Fcnn::with_constant_weights(Arc::clone(&context)).expect("model");
    let input = bound_input(&context, 2, 1.0);

    let (mut output, done) = model.forward_after(&input, &[]).expect("forward");
    output
        .copy_to_host_after(&context, &[done])
        .expect("readback");
    context.drain().expect("drain");
    assert!(output.to_vec().iter().all(|v| (v - 0.1).abs() < TOLERANCE));
}

#[test]
fn test_forward_under_wider_dma_alignment() {
    let config = ContextConfig::from_json_str(r#"{"alignment": 8192}"#).expect("config");
    let context = Arc::new(
        ExecutionContext::with_config(&KernelPackage::host_emulated(), &config).expect("context"),
    );
    let model = Fcnn::with_constant_weights(Arc::clone(&context)).expect("model");
    let mut input = TensorBuffer::constant(2, INPUT_SIZE, 1.0)
        .realigned(context.required_alignment())
        .expect("realign");
    input.bind_to_device(&context, None).expect("bind");

    let (mut output, done) = model.forward_after(&input, &[]).expect("forward");
    assert_eq!(output.alignment(), 8192);
    output
        .copy_to_host_after(&context, &[done])
        .expect("readback");
    context.drain().expect("drain");
    assert!(output.to_vec().iter().all(|v| (v - 0.1).abs() < TOLERANCE));
}

#[test]
fn test_model_from_directory_under_wider_dma_alignment() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_layer_files(dir.path(), NUM_CLASSES);

    let config = ContextConfig::new().with_alignment(16384);
    let context = Arc::new(
        ExecutionContext::with_config(&KernelPackage::host_emulated(), &config).expect("context"),
    );
    let model = Fcnn::from_directory(Arc::clone(&context), dir.path()).expect("model");

    let mut samples = vec![0.0f32; INPUT_SIZE];
    samples[4] = 1.0;
    let mut input = TensorBuffer::from_row_major(1, INPUT_SIZE, &samples)
        .and_then(|t| t.realigned(16384))
        .expect("input");
    input.bind_to_device(&context, None).expect("bind");
    assert_eq!(model.predict(&input).expect("predict"), vec![4]);
}
