use anyhow::Context;
use clap::Parser;
use generator::scene::build_scene;
use sbfcore::io::write_image;
use std::fs;
use std::path::PathBuf;
use workflow::config::WorkflowConfig;
use workflow::runner::Runner;

mod generator;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Synthetic SBF scene driver")]
struct Args {
    /// Load a workflow config from YAML
    #[arg(long)]
    workflow: Option<PathBuf>,
    #[arg(long, default_value_t = 256)]
    size: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Directory for the mask and fit result; overrides the workflow file
    #[arg(long)]
    output: Option<PathBuf>,
    /// Also write the generated image, residual and PSF next to the results
    #[arg(long, default_value_t = false)]
    write_scene: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut workflow_config = if let Some(path) = args.workflow {
        WorkflowConfig::load(path)?
    } else {
        WorkflowConfig::from_args(args.size, args.seed, None)
    };
    if args.output.is_some() {
        workflow_config.output_dir = args.output;
    }

    let scene = build_scene(&workflow_config.scene).context("generating synthetic scene")?;
    if args.write_scene {
        let dir = workflow_config
            .output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir)?;
        for (name, image) in [
            ("image.json", &scene.image),
            ("residual.json", &scene.residual),
            ("psf.json", &scene.psf),
        ] {
            let path = dir.join(name);
            write_image(&path, image).with_context(|| format!("writing {}", path.display()))?;
        }
    }

    let runner = Runner::new(workflow_config);
    let result = runner.execute(&scene)?;

    let summary = serde_json::json!({
        "amplitude": result.sbf.amplitude(),
        "amplitude_error": result.sbf.amplitude_error(),
        "noise_floor": result.sbf.noise_floor(),
        "npix": result.sbf.npix(),
        "amplitude_per_pixel": result.sbf.amplitude() / result.sbf.npix().max(1) as f64,
        "masked_fraction": result.masked_fraction(),
        "chi2": result.sbf.chi2(),
        "elapsed_ms": result.metrics.elapsed.as_millis() as u64,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
