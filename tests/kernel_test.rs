//! Numeric kernels exercised through the queue, the way the forward pass runs them.

use fcnn_offload::kernels::host::{bias_relu6, bias_softmax, matmul};
use fcnn_offload::{
    BiasActivation, ExecutionContext, KernelPackage, TensorBuffer, apply_bias, apply_matmul,
};

const DELTA: f32 = 1e-6;

fn context() -> ExecutionContext {
    ExecutionContext::initialize(&KernelPackage::host_emulated()).expect("context should initialize")
}

fn bound(context: &ExecutionContext, rows: usize, cols: usize, data: &[f32]) -> TensorBuffer {
    let mut tensor = TensorBuffer::from_row_major(rows, cols, data).expect("tensor");
    tensor.bind_to_device(context, None).expect("bind");
    tensor
}

fn read_back(context: &ExecutionContext, tensor: &mut TensorBuffer) -> Vec<f32> {
    tensor.copy_to_host(context).expect("readback");
    context.drain().expect("queue should drain cleanly");
    tensor.to_vec()
}

#[test]
fn test_matmul_square_matrix() {
    let context = context();
    let a = bound(&context, 2, 2, &[1.0, 2.0, 3.0, 4.0]);
    let (mut result, _) = apply_matmul(&context, &a, &a, &[]).expect("matmul");
    assert_eq!(result.shape(), (2, 2));
    assert_eq!(read_back(&context, &mut result), vec![7.0, 10.0, 15.0, 22.0]);
}

#[test]
fn test_matmul_rectangular() {
    let context = context();
    let a = bound(&context, 1, 3, &[1.0, 0.0, -1.0]);
    let b = bound(&context, 3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let (mut result, _) = apply_matmul(&context, &a, &b, &[]).expect("matmul");
    assert_eq!(result.shape(), (1, 2));
    assert_eq!(read_back(&context, &mut result), vec![-4.0, -4.0]);
}

#[test]
fn test_matmul_is_repeatable_into_fresh_outputs() {
    let context = context();
    let a = bound(&context, 2, 2, &[1.0, 2.0, 3.0, 4.0]);
    let (mut first, _) = apply_matmul(&context, &a, &a, &[]).expect("matmul");
    let (mut second, _) = apply_matmul(&context, &a, &a, &[]).expect("matmul");
    assert_eq!(read_back(&context, &mut first), read_back(&context, &mut second));
}

#[test]
fn test_bias_relu6_upper_and_lower_clamp() {
    let context = context();
    let mut activation = bound(&context, 2, 2, &[1.0, 2.0, 3.0, 4.0]);
    let bias = bound(&context, 2, 1, &[2.0, 3.0]);
    apply_bias(&context, &mut activation, &bias, BiasActivation::Relu6, &[]).expect("bias");
    assert_eq!(read_back(&context, &mut activation), vec![3.0, 5.0, 5.0, 6.0]);

    let mut negative = bound(&context, 1, 2, &[1.0, 2.0]);
    let minus_five = bound(&context, 2, 1, &[-5.0, -5.0]);
    apply_bias(&context, &mut negative, &minus_five, BiasActivation::Relu6, &[]).expect("bias");
    assert_eq!(read_back(&context, &mut negative), vec![0.0, 0.0]);
}

#[test]
fn test_bias_softmax_reference_values() {
    let context = context();
    let input = [1.0f32, 2.0, 3.0, 4.0];
    let bias_values = [1.0f32, 2.0];
    let mut activation = bound(&context, 2, 2, &input);
    let bias = bound(&context, 2, 1, &bias_values);
    apply_bias(&context, &mut activation, &bias, BiasActivation::Softmax, &[]).expect("bias");
    let output = read_back(&context, &mut activation);

    for (row, expected_row) in output.chunks(2).zip(input.chunks(2)) {
        assert!((row.iter().sum::<f32>() - 1.0).abs() < DELTA);
        assert!((row[0] - 0.1192029).abs() < DELTA);
        assert!((row[1] - 0.8807971).abs() < DELTA);

        let exps: Vec<f32> = expected_row
            .iter()
            .zip(&bias_values)
            .map(|(x, b)| (x + b).exp())
            .collect();
        let sum: f32 = exps[0] + exps[1];
        assert_eq!(row[0].to_bits(), (exps[0] / sum).to_bits());
        assert_eq!(row[1].to_bits(), (exps[1] / sum).to_bits());
    }
}

#[test]
fn test_queued_kernels_match_reference_functions() {
    let a_values: Vec<f32> = (0..12).map(|v| v as f32 * 0.25 - 1.0).collect();
    let b_values: Vec<f32> = (0..8).map(|v| 0.5 - v as f32 * 0.125).collect();
    let bias_values = [0.25f32, -0.5];

    let mut expected = vec![0.0; 6 * 2];
    matmul(&a_values, &b_values, 6, 2, 2, &mut expected[..12]);
    let mut expected_relu = expected.clone();
    bias_relu6(&mut expected_relu, &bias_values, 6, 2);
    let mut expected_softmax = expected.clone();
    bias_softmax(&mut expected_softmax, &bias_values, 6, 2);

    let context = context();
    let a = bound(&context, 6, 2, &a_values);
    let b = bound(&context, 2, 2, &b_values[..4]);
    let bias = bound(&context, 1, 2, &bias_values);

    let (mut relu, relu_mm) = apply_matmul(&context, &a, &b, &[]).expect("matmul");
    apply_bias(&context, &mut relu, &bias, BiasActivation::Relu6, &[relu_mm]).expect("bias");
    let (mut softmax, softmax_mm) = apply_matmul(&context, &a, &b, &[]).expect("matmul");
    apply_bias(&context, &mut softmax, &bias, BiasActivation::Softmax, &[softmax_mm])
        .expect("bias");

    assert_eq!(read_back(&context, &mut relu), expected_relu);
    let softmax_bits: Vec<u32> = read_back(&context, &mut softmax)
        .iter()
        .map(|v| v.to_bits())
        .collect();
    let expected_bits: Vec<u32> = expected_softmax.iter().map(|v| v.to_bits()).collect();
    assert_eq!(softmax_bits, expected_bits);
}
