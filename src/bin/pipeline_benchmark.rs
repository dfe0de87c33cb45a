//! Times repeated forward passes of the constant-weight model.
//!
//! Usage: `pipeline_benchmark [--iterations N] [--batch B]`
//!
//! Run with `RUST_LOG=info` to see the report.

use std::env;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fcnn_offload::errors::PipelineResult;
use fcnn_offload::fcnn::INPUT_SIZE;
use fcnn_offload::{ContextConfig, ExecutionContext, Fcnn, ForwardStage, KernelPackage, TensorBuffer};
use log::{error, info};

const DEFAULT_ITERATIONS: usize = 100;
const DEFAULT_BATCH: usize = 64;

struct StageTotals {
    stage: ForwardStage,
    queued: Duration,
    execution: Duration,
}

fn parse_args() -> Result<(usize, usize), String> {
    let mut iterations = DEFAULT_ITERATIONS;
    let mut batch = DEFAULT_BATCH;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        let target = match arg.as_str() {
            "--iterations" => &mut iterations,
            "--batch" => &mut batch,
            other => return Err(format!("unknown argument '{other}'")),
        };
        let value = args.next().ok_or_else(|| format!("{arg} needs a value"))?;
        *target = value
            .parse()
            .map_err(|_| format!("{arg} expects a positive integer, got '{value}'"))?;
        if *target == 0 {
            return Err(format!("{arg} must be at least 1"));
        }
    }
    Ok((iterations, batch))
}

fn run(iterations: usize, batch: usize) -> PipelineResult<()> {
    let context = Arc::new(ExecutionContext::with_config(
        &KernelPackage::host_emulated(),
        &ContextConfig::default(),
    )?);
    let model = Fcnn::with_constant_weights(Arc::clone(&context))?;

    let mut input = TensorBuffer::constant(batch, INPUT_SIZE, 1.0);
    input.bind_to_device(&context, None)?;

    info!("{}", "=".repeat(80));
    info!("Pipeline Benchmark");
    info!(
        "Model: {} -> {} -> {}, batch {}, {} iterations, {} compute units",
        model.input_size(),
        model.hidden_size(),
        model.num_classes(),
        batch,
        iterations,
        context.compute_units()
    );
    info!("{}", "=".repeat(80));

    // Warmup, also settles the weight migrations.
    let mut warmup = model.forward(&input)?;
    warmup.copy_to_host(&context)?;
    context.drain()?;

    let mut totals: Vec<StageTotals> = [
        ForwardStage::HiddenPreActivation,
        ForwardStage::Hidden,
        ForwardStage::OutputPreActivation,
        ForwardStage::Output,
    ]
    .into_iter()
    .map(|stage| StageTotals {
        stage,
        queued: Duration::ZERO,
        execution: Duration::ZERO,
    })
    .collect();
    let mut wall = Duration::ZERO;
    let mut fastest = Duration::MAX;
    for _ in 0..iterations {
        let start = Instant::now();
        let pass = model.forward_traced(&input, &[])?;
        let mut output = pass.output;
        output.copy_to_host_after(&context, std::slice::from_ref(&pass.stages[3].1))?;
        context.drain()?;
        let elapsed = start.elapsed();
        wall += elapsed;
        fastest = fastest.min(elapsed);

        for (total, (_, event)) in totals.iter_mut().zip(&pass.stages) {
            if let Some(profile) = event.profile() {
                total.queued += profile.queued;
                total.execution += profile.execution;
            }
        }
    }

    let n = iterations as u32;
    info!(
        "Forward + readback: mean {:.3?}, fastest {:.3?} ({:.1} samples/sec)",
        wall / n,
        fastest,
        (iterations * batch) as f64 / wall.as_secs_f64()
    );
    info!("{}", "-".repeat(80));
    for total in &totals {
        info!(
            "{:<24} mean device time {:>10.3?}   mean queue wait {:>10.3?}",
            total.stage.name(),
            total.execution / n,
            total.queued / n
        );
    }
    info!("{}", "=".repeat(80));
    Ok(())
}

fn main() {
    env_logger::init();

    let (iterations, batch) = match parse_args() {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("usage: pipeline_benchmark [--iterations N] [--batch B]");
            process::exit(2);
        }
    };

    if let Err(e) = run(iterations, batch) {
        error!("Benchmark failed: {e}");
        process::exit(1);
    }
}
