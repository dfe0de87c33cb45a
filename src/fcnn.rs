//! Two-layer fully connected classifier driven through the offload pipeline.
//!
//! `input → matmul(W1) → bias+relu6(b1) → matmul(W2) → bias+softmax(b2)`
//!
//! Every stage after the first names the previous stage's token as its
//! dependency; the forward pass itself never blocks the host.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use crate::context::ExecutionContext;
use crate::device::Event;
use crate::errors::{PipelineError, PipelineResult};
use crate::ops::{BiasActivation, apply_bias, apply_matmul};
use crate::tensor::TensorBuffer;

/// Input width of the constant-weight model (28×28 images).
pub const INPUT_SIZE: usize = 784;
pub const HIDDEN_SIZE: usize = 64;
pub const NUM_CLASSES: usize = 10;

const CONSTANT_WEIGHT1: f32 = 1.0;
const CONSTANT_WEIGHT2: f32 = 0.001;

/// Host-side parameters of the two dense layers.
#[derive(Debug)]
pub struct FcnnWeights {
    pub weight1: TensorBuffer,
    pub bias1: TensorBuffer,
    pub weight2: TensorBuffer,
    pub bias2: TensorBuffer,
}

impl FcnnWeights {
    /// `W1` of ones (784×64), zero `b1`, `W2` of 0.001 (64×10), zero `b2`.
    pub fn constant() -> Self {
        Self {
            weight1: TensorBuffer::constant(INPUT_SIZE, HIDDEN_SIZE, CONSTANT_WEIGHT1),
            bias1: TensorBuffer::constant(HIDDEN_SIZE, 1, 0.0),
            weight2: TensorBuffer::constant(HIDDEN_SIZE, NUM_CLASSES, CONSTANT_WEIGHT2),
            bias2: TensorBuffer::constant(NUM_CLASSES, 1, 0.0),
        }
    }

    /// Reads `w1.npy`, `b1.npy`, `w2.npy` and `b2.npy` from `dir`.
    pub fn from_directory(dir: impl AsRef<Path>) -> PipelineResult<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            weight1: TensorBuffer::from_npy(dir.join("w1.npy"))?,
            bias1: TensorBuffer::from_npy(dir.join("b1.npy"))?,
            weight2: TensorBuffer::from_npy(dir.join("w2.npy"))?,
            bias2: TensorBuffer::from_npy(dir.join("b2.npy"))?,
        })
    }

    /// Moves every parameter into host memory aligned to `alignment` bytes.
    pub fn realigned(self, alignment: usize) -> PipelineResult<Self> {
        Ok(Self {
            weight1: self.weight1.realigned(alignment)?,
            bias1: self.bias1.realigned(alignment)?,
            weight2: self.weight2.realigned(alignment)?,
            bias2: self.bias2.realigned(alignment)?,
        })
    }

    fn validate(&self) -> PipelineResult<()> {
        let hidden = self.weight1.cols();
        if self.bias1.len() != hidden {
            return Err(PipelineError::ShapeMismatch {
                operation: "fcnn layer 1 bias",
                lhs: self.weight1.shape(),
                rhs: self.bias1.shape(),
            });
        }
        if self.weight2.rows() != hidden {
            return Err(PipelineError::ShapeMismatch {
                operation: "fcnn layer 2 weight",
                lhs: self.weight1.shape(),
                rhs: self.weight2.shape(),
            });
        }
        if self.bias2.len() != self.weight2.cols() {
            return Err(PipelineError::ShapeMismatch {
                operation: "fcnn layer 2 bias",
                lhs: self.weight2.shape(),
                rhs: self.bias2.shape(),
            });
        }
        Ok(())
    }
}

/// The four device-side stages of one forward pass, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardStage {
    HiddenPreActivation,
    Hidden,
    OutputPreActivation,
    Output,
}

impl ForwardStage {
    pub fn name(&self) -> &'static str {
        match self {
            ForwardStage::HiddenPreActivation => "hidden pre-activation",
            ForwardStage::Hidden => "hidden",
            ForwardStage::OutputPreActivation => "output pre-activation",
            ForwardStage::Output => "output",
        }
    }
}

/// Result of an enqueued forward pass: the device-resident output and the
/// token of each stage.
#[derive(Debug)]
pub struct ForwardPass {
    pub output: TensorBuffer,
    pub stages: [(ForwardStage, Event); 4],
}

impl ForwardPass {
    /// Token of the final stage; resolves once the probabilities are on the device.
    pub fn completion(&self) -> &Event {
        &self.stages[3].1
    }
}

pub struct Fcnn {
    context: Arc<ExecutionContext>,
    weights: FcnnWeights,
}

impl Fcnn {
    /// Validates layer shapes and binds every weight to the device once.
    ///
    /// Weights are realigned to the context's DMA alignment first. The
    /// migrations are enqueued, not awaited: the first forward pass depends
    /// on their tokens.
    pub fn new(context: Arc<ExecutionContext>, weights: FcnnWeights) -> PipelineResult<Self> {
        weights.validate()?;
        let mut weights = weights.realigned(context.required_alignment())?;
        weights.weight1.bind_to_device(&context, None)?;
        weights.bias1.bind_to_device(&context, None)?;
        weights.weight2.bind_to_device(&context, None)?;
        weights.bias2.bind_to_device(&context, None)?;

        info!(
            "Model ready: {} -> {} -> {} on '{}'",
            weights.weight1.rows(),
            weights.weight1.cols(),
            weights.weight2.cols(),
            context.device().name()
        );
        Ok(Self { context, weights })
    }

    pub fn with_constant_weights(context: Arc<ExecutionContext>) -> PipelineResult<Self> {
        Self::new(context, FcnnWeights::constant())
    }

    pub fn from_directory(
        context: Arc<ExecutionContext>,
        dir: impl AsRef<Path>,
    ) -> PipelineResult<Self> {
        let weights = FcnnWeights::from_directory(dir)?;
        Self::new(context, weights)
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    pub fn input_size(&self) -> usize {
        self.weights.weight1.rows()
    }

    pub fn hidden_size(&self) -> usize {
        self.weights.weight1.cols()
    }

    pub fn num_classes(&self) -> usize {
        self.weights.weight2.cols()
    }

    /// Enqueues the forward pass for a device-bound `input`.
    ///
    /// The returned tensor is device-resident; read it back with
    /// [`TensorBuffer::copy_to_host_after`] before inspecting host values.
    pub fn forward(&self, input: &TensorBuffer) -> PipelineResult<TensorBuffer> {
        Ok(self.forward_traced(input, &[])?.output)
    }

    /// Like [`forward`](Self::forward), also returning the final stage's token.
    pub fn forward_after(
        &self,
        input: &TensorBuffer,
        wait_on: &[Event],
    ) -> PipelineResult<(TensorBuffer, Event)> {
        let pass = self.forward_traced(input, wait_on)?;
        let completion = pass.completion().clone();
        Ok((pass.output, completion))
    }

    /// Enqueues the forward pass and returns every stage token.
    pub fn forward_traced(
        &self,
        input: &TensorBuffer,
        wait_on: &[Event],
    ) -> PipelineResult<ForwardPass> {
        if input.cols() != self.input_size() {
            return Err(PipelineError::ShapeMismatch {
                operation: "forward",
                lhs: input.shape(),
                rhs: self.weights.weight1.shape(),
            });
        }
        let context = self.context.as_ref();
        let weights = &self.weights;

        let (mut hidden, pre_hidden) = apply_matmul(context, input, &weights.weight1, wait_on)?;
        let hidden_done = apply_bias(
            context,
            &mut hidden,
            &weights.bias1,
            BiasActivation::Relu6,
            std::slice::from_ref(&pre_hidden),
        )?;
        let (mut output, pre_output) = apply_matmul(
            context,
            &hidden,
            &weights.weight2,
            std::slice::from_ref(&hidden_done),
        )?;
        let output_done = apply_bias(
            context,
            &mut output,
            &weights.bias2,
            BiasActivation::Softmax,
            std::slice::from_ref(&pre_output),
        )?;

        debug!(
            "Forward pass for {} rows enqueued as events {}, {}, {}, {}",
            input.rows(),
            pre_hidden.id(),
            hidden_done.id(),
            pre_output.id(),
            output_done.id()
        );

        Ok(ForwardPass {
            output,
            stages: [
                (ForwardStage::HiddenPreActivation, pre_hidden),
                (ForwardStage::Hidden, hidden_done),
                (ForwardStage::OutputPreActivation, pre_output),
                (ForwardStage::Output, output_done),
            ],
        })
    }

    /// Runs the forward pass, reads the probabilities back and returns the
    /// most likely class of every row. Blocks until the queue drains.
    pub fn predict(&self, input: &TensorBuffer) -> PipelineResult<Vec<usize>> {
        let pass = self.forward_traced(input, &[])?;
        let mut output = pass.output;
        output.copy_to_host_after(&self.context, std::slice::from_ref(&pass.stages[3].1))?;
        self.context.drain()?;
        argmax_rows(&output)
    }
}

/// Index of the largest host value in every row.
///
/// The first maximum wins on ties. NaN never compares greater, so a row that
/// starts with NaN and holds nothing larger reports index 0.
pub fn argmax_rows(tensor: &TensorBuffer) -> PipelineResult<Vec<usize>> {
    if tensor.cols() == 0 {
        return Err(PipelineError::ShapeMismatch {
            operation: "argmax",
            lhs: tensor.shape(),
            rhs: (tensor.rows(), 1),
        });
    }
    let data = tensor.to_vec();
    Ok(data
        .chunks_exact(tensor.cols())
        .map(|row| {
            let mut best = 0;
            for (index, &value) in row.iter().enumerate().skip(1) {
                if value > row[best] {
                    best = index;
                }
            }
            best
        })
        .collect())
}
