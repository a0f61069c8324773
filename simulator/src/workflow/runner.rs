use crate::generator::scene::Scene;
use crate::workflow::config::WorkflowConfig;
use anyhow::Context;
use log::info;
use sbfcore::io::write_mask;
use sbfcore::prelude::{Mask, ProcessingStage};
use sbfcore::processing::{FitInput, FitStage, MaskingStage};
use sbfcore::telemetry::{MetricsRecorder, MetricsSnapshot};
use sbfcore::{ImageSource, SbfResult};
use std::fs;
use std::time::Instant;

pub const MASK_FILE: &str = "mask.json";
pub const RESULT_FILE: &str = "sbf_result.json";

pub struct WorkflowResult {
    pub mask: Mask,
    pub sbf: SbfResult,
    pub metrics: MetricsSnapshot,
}

impl WorkflowResult {
    pub fn masked_fraction(&self) -> f64 {
        let masked = self.mask.iter().filter(|excluded| **excluded).count();
        masked as f64 / self.mask.len().max(1) as f64
    }
}

pub struct Runner {
    config: WorkflowConfig,
    metrics: MetricsRecorder,
}

impl Runner {
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            config,
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn execute(&self, scene: &Scene) -> anyhow::Result<WorkflowResult> {
        let started = Instant::now();
        let outcome = self.run_stages(scene);
        match &outcome {
            Ok(_) => self.metrics.record_processed(started.elapsed()),
            Err(_) => self.metrics.record_error(),
        }
        let (mask, sbf) = outcome?;

        if let Some(dir) = self.config.output_dir.as_ref() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating output directory {}", dir.display()))?;
            let mask_path = dir.join(MASK_FILE);
            write_mask(&mask_path, &mask)
                .with_context(|| format!("writing mask {}", mask_path.display()))?;
            let result_path = dir.join(RESULT_FILE);
            sbf.to_file(&result_path)
                .with_context(|| format!("writing result {}", result_path.display()))?;
            info!("wrote {} and {}", mask_path.display(), result_path.display());
        }

        Ok(WorkflowResult {
            mask,
            sbf,
            metrics: self.metrics.snapshot(),
        })
    }

    fn run_stages(&self, scene: &Scene) -> anyhow::Result<(Mask, SbfResult)> {
        let mut masking_stage = MaskingStage::new();
        masking_stage
            .initialize(&self.config.mask)
            .context("initializing masking stage")?;
        let mask = masking_stage
            .execute(ImageSource::from(scene.image.clone()))
            .context("executing masking stage")?;
        masking_stage.cleanup();
        self.metrics
            .record_masked(mask.iter().filter(|excluded| **excluded).count());

        let mut fit_stage = FitStage::new();
        fit_stage
            .initialize(&self.config.measure)
            .context("initializing fit stage")?;
        let sbf = fit_stage
            .execute(FitInput {
                residual: scene.residual.clone(),
                psf: scene.psf.clone(),
                mask: Some(mask.clone()),
            })
            .context("executing fit stage")?;
        fit_stage.cleanup();

        Ok((mask, sbf))
    }
}
