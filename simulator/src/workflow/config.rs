use anyhow::Context;
use sbfcore::{GalaxyMaskConfig, MeasureConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::generator::scene::SceneConfig;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub scene: SceneConfig,
    pub mask: GalaxyMaskConfig,
    pub measure: MeasureConfig,
    /// Directory receiving `mask.json` and `sbf_result.json`.
    pub output_dir: Option<PathBuf>,
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        Ok(config)
    }

    pub fn from_args(size: usize, seed: u64, output_dir: Option<PathBuf>) -> Self {
        let mut config = Self {
            scene: SceneConfig {
                size,
                seed,
                ..Default::default()
            },
            output_dir,
            ..Default::default()
        };
        // keep a few background boxes across small scenes
        let box_size = config.mask.detection.background.box_size.min((size / 4).max(1));
        config.mask.detection.background.box_size = box_size;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbfcore::processing::GalaxyPosition;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn config_from_args_scales_background_boxes() {
        let cfg = WorkflowConfig::from_args(128, 7, None);
        assert_eq!(cfg.scene.size, 128);
        assert_eq!(cfg.scene.seed, 7);
        assert_eq!(cfg.mask.detection.background.box_size, 32);

        let large = WorkflowConfig::from_args(1024, 0, None);
        assert_eq!(large.mask.detection.background.box_size, 110);
    }

    #[test]
    fn config_load_reads_yaml() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(
            b"scene:\n  size: 96\n  star_count: 2\nmask:\n  galaxy_position:\n    at:\n      x: 40.0\n      y: 50.0\n  obj_exclusion_radius: 10.0\nmeasure:\n  k_range: [0.05, 0.3]\noutput_dir: out\n",
        )
        .unwrap();
        let path = temp.into_temp_path();
        let cfg = WorkflowConfig::load(&path).unwrap();
        assert_eq!(cfg.scene.size, 96);
        assert_eq!(cfg.scene.star_count, 2);
        assert_eq!(cfg.scene.psf_sigma, SceneConfig::default().psf_sigma);
        assert_eq!(cfg.mask.galaxy_position, GalaxyPosition::At { x: 40.0, y: 50.0 });
        assert_eq!(cfg.mask.obj_exclusion_radius, 10.0);
        assert_eq!(cfg.mask.seg_exclusion_radius, 100.0);
        assert_eq!(cfg.measure.k_range, (0.05, 0.3));
        assert_eq!(cfg.measure.num_radial_bins, 45);
        assert_eq!(cfg.output_dir, Some(PathBuf::from("out")));
    }

    #[test]
    fn config_load_reads_named_position() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"mask:\n  galaxy_position: center\n").unwrap();
        let path = temp.into_temp_path();
        let cfg = WorkflowConfig::load(&path).unwrap();
        assert_eq!(cfg.mask.galaxy_position, GalaxyPosition::Center);

        let written = serde_yaml::to_string(&cfg).unwrap();
        assert!(!written.contains('!'));
        let mut moved = cfg.clone();
        moved.mask.galaxy_position = GalaxyPosition::At { x: 12.5, y: 7.0 };
        let reparsed: WorkflowConfig =
            serde_yaml::from_str(&serde_yaml::to_string(&moved).unwrap()).unwrap();
        assert_eq!(reparsed.mask.galaxy_position, moved.mask.galaxy_position);
    }

    #[test]
    fn config_load_reports_path() {
        let err = WorkflowConfig::load("/nonexistent/workflow.yaml").unwrap_err();
        assert!(format!("{:#}", err).contains("workflow.yaml"));
    }
}
