//! Classifies samples with weights loaded from a directory of `.npy` files.
//!
//! Usage: `fcnn_infer <weights_dir> [samples.npy] [--config ctx.json] [--gpu]`
//!
//! The directory must contain `w1.npy`, `b1.npy`, `w2.npy` and `b2.npy`.
//! Samples default to `<weights_dir>/samples.npy`. The predicted class of
//! every sample is printed on one line, separated by spaces.

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use fcnn_offload::errors::{PipelineError, PipelineResult};
use fcnn_offload::{ContextConfig, ExecutionContext, Fcnn, KernelPackage, TensorBuffer};
use log::{error, info};

const USAGE: &str = "usage: fcnn_infer <weights_dir> [samples.npy] [--config ctx.json] [--gpu]";

struct Args {
    weights_dir: PathBuf,
    samples: PathBuf,
    config: Option<PathBuf>,
    gpu: bool,
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut positional = Vec::new();
    let mut config = None;
    let mut gpu = false;

    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--config" => {
                let path = raw.next().ok_or("--config needs a file path")?;
                config = Some(PathBuf::from(path));
            }
            "--gpu" => gpu = true,
            "-h" | "--help" => return Err(USAGE.to_string()),
            flag if flag.starts_with("--") => return Err(format!("unknown option '{flag}'")),
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    let mut positional = positional.into_iter();
    let weights_dir = positional.next().ok_or(USAGE)?;
    let samples = positional
        .next()
        .unwrap_or_else(|| weights_dir.join("samples.npy"));
    if positional.next().is_some() {
        return Err(USAGE.to_string());
    }

    Ok(Args {
        weights_dir,
        samples,
        config,
        gpu,
    })
}

fn kernel_package(gpu: bool) -> PipelineResult<KernelPackage> {
    if gpu {
        gpu_kernel_package()
    } else {
        Ok(KernelPackage::host_emulated())
    }
}

#[cfg(feature = "gpu")]
fn gpu_kernel_package() -> PipelineResult<KernelPackage> {
    fcnn_offload::kernels::gpu::gpu_package().ok_or_else(|| PipelineError::Config {
        message: "no wgpu adapter available".to_string(),
    })
}

#[cfg(not(feature = "gpu"))]
fn gpu_kernel_package() -> PipelineResult<KernelPackage> {
    Err(PipelineError::Config {
        message: "built without the 'gpu' feature".to_string(),
    })
}

fn run(args: Args) -> PipelineResult<Vec<usize>> {
    let config = match &args.config {
        Some(path) => ContextConfig::from_json_file(path)?,
        None => ContextConfig::default(),
    };
    let package = kernel_package(args.gpu)?;
    let context = Arc::new(ExecutionContext::with_config(&package, &config)?);

    let model = Fcnn::from_directory(Arc::clone(&context), &args.weights_dir)?;
    let mut samples =
        TensorBuffer::from_npy(&args.samples)?.realigned(context.required_alignment())?;
    info!(
        "Loaded {} samples of width {} from {}",
        samples.rows(),
        samples.cols(),
        args.samples.display()
    );
    samples.bind_to_device(&context, None)?;

    model.predict(&samples)
}

fn main() {
    env_logger::init();

    let args = match parse_args(env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            process::exit(2);
        }
    };

    match run(args) {
        Ok(classes) => {
            let line: Vec<String> = classes.iter().map(|class| class.to_string()).collect();
            println!("{}", line.join(" "));
        }
        Err(e) => {
            error!("Inference failed: {e}");
            process::exit(1);
        }
    }
}
