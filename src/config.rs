//! Reconstruction and alignment settings.
//!
//! Both structs deserialize with per-field defaults, so a partial JSON
//! document such as `{"alpha": 0.05}` is a valid configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};
use crate::estimate::VolumeEstimate;
use crate::operator::{AcquisitionKernel, Regularization};
use crate::registration::RegistrationOptions;
use crate::solvers::Minimizer;

/// Settings of a Tikhonov-regularised SRR solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    pub regularization: Regularization,
    pub minimizer: Minimizer,
    pub iter_max: usize,
    pub alpha: f64,
    pub kernel: AcquisitionKernel,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            regularization: Regularization::Tk1,
            minimizer: Minimizer::Lsmr,
            iter_max: 10,
            alpha: 0.02,
            kernel: AcquisitionKernel::OrientedGaussian,
        }
    }
}

impl ReconstructionConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(ReconError::config(format!(
                "alpha must be finite and non-negative, got {}",
                self.alpha
            )));
        }
        if self.iter_max == 0 {
            return Err(ReconError::config("iter_max must be at least 1"));
        }
        Ok(())
    }
}

/// Settings of the hierarchical slice alignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Interleave of the acquisition: slices `g, g + step, …` form a group.
    pub step: usize,
    pub volume_estimate: VolumeEstimate,
    /// Kernel width (mm) of the scattered data approximation.
    pub sigma: f64,
    /// Whether the stack average is restricted to the union of the masks.
    pub mask_voxels: bool,
    pub registration: RegistrationOptions,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            step: 3,
            volume_estimate: VolumeEstimate::Sda,
            sigma: 1.0,
            mask_voxels: false,
            registration: RegistrationOptions::default(),
        }
    }
}

impl AlignmentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.step == 0 {
            return Err(ReconError::config("alignment step must be at least 1"));
        }
        if !(self.sigma.is_finite() && self.sigma > 0.0) {
            return Err(ReconError::config(format!(
                "sigma must be positive, got {}",
                self.sigma
            )));
        }
        self.registration.validate()
    }
}

/// Read a JSON configuration file.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_standard_setting() {
        let config = ReconstructionConfig::default();
        assert_eq!(config.iter_max, 10);
        assert_eq!(config.alpha, 0.02);
        assert_eq!(config.regularization, Regularization::Tk1);
        assert_eq!(config.minimizer, Minimizer::Lsmr);
        assert!(config.validate().is_ok());
        assert!(AlignmentConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_invalid_settings() {
        let negative = ReconstructionConfig {
            alpha: -0.1,
            ..Default::default()
        };
        assert!(matches!(negative.validate(), Err(ReconError::InvalidConfig(_))));

        let nan = ReconstructionConfig {
            alpha: f64::NAN,
            ..Default::default()
        };
        assert!(nan.validate().is_err());

        let no_iterations = ReconstructionConfig {
            iter_max: 0,
            ..Default::default()
        };
        assert!(no_iterations.validate().is_err());

        let zero_step = AlignmentConfig {
            step: 0,
            ..Default::default()
        };
        assert!(zero_step.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: ReconstructionConfig =
            serde_json::from_str(r#"{"alpha": 0.05, "regularization": "TK0"}"#).unwrap();
        assert_eq!(config.alpha, 0.05);
        assert_eq!(config.regularization, Regularization::Tk0);
        assert_eq!(config.iter_max, 10);

        let alignment: AlignmentConfig =
            serde_json::from_str(r#"{"volume_estimate": "average"}"#).unwrap();
        assert_eq!(alignment.volume_estimate, VolumeEstimate::Average);
        assert_eq!(alignment.step, 3);
    }

    #[test]
    fn loads_config_from_file() {
        let path = std::env::temp_dir().join(format!("srr_config_{}.json", std::process::id()));
        std::fs::write(&path, r#"{"iter_max": 25, "minimizer": "cgls"}"#).unwrap();
        let config: ReconstructionConfig = load_config(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.iter_max, 25);
        assert_eq!(config.minimizer, Minimizer::Cgls);
    }
}
