use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ahc::AhcOptions;
use crate::coupled::CoupledOptions;
use crate::init::InitMode;
use crate::io::rttm::DEFAULT_OVERLAP_FRACTION;
use crate::similarity::SimilarityKind;
use crate::spectral::NmeOptions;
use crate::vbx::VbOptions;
use crate::DiarizeError;

/// Full diarization configuration, loadable from YAML or JSON.
///
/// Every section may be omitted. Zero values of fields where zero is never
/// meaningful are replaced by defaults in [`DiarizeConfig::with_defaults`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiarizeConfig {
    /// `spectral`, `spectral+vb`, `ahc`, `ahc+vb` or `random_N`.
    pub init: InitMode,

    /// Affinity used by the spectral step.
    pub similarity: SimilarityKind,

    /// Minimum covered fraction for a window to count as overlapped.
    pub overlap_fraction: f64,

    pub spectral: NmeOptions,
    pub ahc: AhcOptions,
    pub vbx: VbxConfig,
    pub coupled: CoupledConfig,
}

impl Default for DiarizeConfig {
    fn default() -> Self {
        Self {
            init: InitMode::default(),
            similarity: SimilarityKind::default(),
            overlap_fraction: DEFAULT_OVERLAP_FRACTION,
            spectral: NmeOptions::default(),
            ahc: AhcOptions::default(),
            vbx: VbxConfig::default(),
            coupled: CoupledConfig::default(),
        }
    }
}

/// Single-stream VB-HMM settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VbxConfig {
    /// Leading PLDA dimensions used as VB features.
    pub lda_dim: usize,

    /// Sharpness of the soft start derived from hard labels.
    pub init_smoothing: f64,

    /// Speaker slots of each random start.
    pub max_random_speakers: usize,

    #[serde(flatten)]
    pub options: VbOptions,
}

impl Default for VbxConfig {
    fn default() -> Self {
        Self {
            lda_dim: 128,
            init_smoothing: 5.0,
            max_random_speakers: 10,
            options: VbOptions::default(),
        }
    }
}

/// Coupled two-stream VB-HMM settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoupledConfig {
    pub init_smoothing: f64,

    #[serde(flatten)]
    pub options: CoupledOptions,
}

impl Default for CoupledConfig {
    fn default() -> Self {
        Self {
            init_smoothing: 10.0,
            options: CoupledOptions::default(),
        }
    }
}

impl DiarizeConfig {
    /// Loads a config file; `.json` is read as JSON, anything else as YAML.
    pub fn load(path: &Path) -> Result<Self, DiarizeError> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let cfg = if is_json { Self::from_json(&content)? } else { Self::from_yaml(&content)? };
        Ok(cfg)
    }

    pub fn from_yaml(s: &str) -> Result<Self, DiarizeError> {
        serde_yaml::from_str::<Self>(s)
            .map(Self::with_defaults)
            .map_err(|e| DiarizeError::Config(e.to_string()))
    }

    pub fn from_json(s: &str) -> Result<Self, DiarizeError> {
        serde_json::from_str::<Self>(s)
            .map(Self::with_defaults)
            .map_err(|e| DiarizeError::Config(e.to_string()))
    }

    /// Fills unset (zero) fields with their defaults.
    pub fn with_defaults(mut self) -> Self {
        let nme = NmeOptions::default();
        if self.spectral.pmax == 0 {
            self.spectral.pmax = nme.pmax;
        }
        if self.spectral.max_speakers == 0 {
            self.spectral.max_speakers = nme.max_speakers;
        }
        if self.spectral.kmeans_inits == 0 {
            self.spectral.kmeans_inits = nme.kmeans_inits;
        }

        if self.ahc.calibration_iters == 0 {
            self.ahc.calibration_iters = AhcOptions::default().calibration_iters;
        }

        let vbx = VbxConfig::default();
        if self.vbx.lda_dim == 0 {
            self.vbx.lda_dim = vbx.lda_dim;
        }
        if self.vbx.init_smoothing == 0.0 {
            self.vbx.init_smoothing = vbx.init_smoothing;
        }
        if self.vbx.max_random_speakers == 0 {
            self.vbx.max_random_speakers = vbx.max_random_speakers;
        }
        let vb = &mut self.vbx.options;
        if vb.max_iters == 0 {
            vb.max_iters = vbx.options.max_iters;
        }
        if vb.epsilon == 0.0 {
            vb.epsilon = vbx.options.epsilon;
        }
        if vb.fa == 0.0 {
            vb.fa = vbx.options.fa;
        }
        if vb.fb == 0.0 {
            vb.fb = vbx.options.fb;
        }
        if vb.min_dur == 0 {
            vb.min_dur = 1;
        }
        if vb.max_speakers == 0 {
            vb.max_speakers = vbx.options.max_speakers;
        }
        if vb.alpha_q_init == 0.0 {
            vb.alpha_q_init = vbx.options.alpha_q_init;
        }

        let coupled = CoupledConfig::default();
        if self.coupled.init_smoothing == 0.0 {
            self.coupled.init_smoothing = coupled.init_smoothing;
        }
        let co = &mut self.coupled.options;
        if co.max_iters == 0 {
            co.max_iters = coupled.options.max_iters;
        }
        if co.epsilon == 0.0 {
            co.epsilon = coupled.options.epsilon;
        }
        if co.fa == 0.0 {
            co.fa = coupled.options.fa;
        }
        if co.fb == 0.0 {
            co.fb = coupled.options.fb;
        }
        if co.max_speakers == 0 {
            co.max_speakers = coupled.options.max_speakers;
        }
        if co.alpha_q_init == 0.0 {
            co.alpha_q_init = coupled.options.alpha_q_init;
        }

        if self.overlap_fraction == 0.0 {
            self.overlap_fraction = DEFAULT_OVERLAP_FRACTION;
        }
        self
    }

    /// Uses `seed` for every random component.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.spectral.seed = seed;
        self.vbx.options.seed = seed;
        self.coupled.options.seed = seed;
        self
    }

    /// Rejects invalid settings before any numeric work.
    pub fn validate(&self) -> Result<(), DiarizeError> {
        self.spectral.validate()?;
        self.ahc.validate()?;
        self.vbx.options.validate()?;
        self.coupled.options.validate()?;
        if !(self.overlap_fraction > 0.0 && self.overlap_fraction <= 1.0) {
            return Err(DiarizeError::Config(format!(
                "overlap_fraction must be in (0, 1], got {}",
                self.overlap_fraction
            )));
        }
        if self.vbx.lda_dim == 0 {
            return Err(DiarizeError::Config("lda_dim must be >= 1".into()));
        }
        if !(self.vbx.init_smoothing > 0.0) || !(self.coupled.init_smoothing > 0.0) {
            return Err(DiarizeError::Config("init_smoothing must be positive".into()));
        }
        Ok(())
    }

    /// Whether the chosen init mode runs VB (and so needs a PLDA model).
    pub fn needs_vb(&self) -> bool {
        !matches!(self.init, InitMode::Spectral | InitMode::Ahc)
    }
}
