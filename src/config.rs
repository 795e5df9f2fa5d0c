use std::{path::Path, str::FromStr};

use candle::Device;
use ini::Ini;
use serde::{Deserialize, Serialize};

use crate::error::{KpnError, Result};

pub const DATASET_DUCONV: &str = "duconv";
pub const DEFAULT_DEVICE: &str = "cpu";
pub const DEFAULT_EMBEDDING: &str = "embedding.safetensors";
pub const DEFAULT_EMBEDDING_TENSOR: &str = "embedding";
pub const SETTINGS_FILE: &str = "kpn.ini";

const MATCH_CHANNELS: usize = 64;

/// Size preset picked by dataset name at construction time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preset {
    /// DuConv: short goals and knowledge snippets.
    Short,
    /// Every other dataset.
    Long,
}

impl Preset {
    /// Exact, case-sensitive match on the dataset name.
    pub fn from_dataset(name: &str) -> Self {
        if name == DATASET_DUCONV {
            Self::Short
        } else {
            Self::Long
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpnConfig {
    pub emb_size: usize,
    pub hidden_size: usize,
    pub n_layer: usize,
    pub max_context_len: usize,
    pub max_response_len: usize,
    pub max_goal_len: usize,
    pub max_knowledge_num: usize,
    pub max_knowledge_len: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default)]
    pub transformer_layer_norm: bool,
}

fn default_dropout() -> f32 {
    0.1
}

impl KpnConfig {
    pub fn preset(preset: Preset) -> Self {
        let (max_goal_len, max_knowledge_num, max_knowledge_len) = match preset {
            Preset::Short => (3, 23, 10),
            Preset::Long => (6, 35, 30),
        };
        Self {
            emb_size: 300,
            hidden_size: 300,
            n_layer: 4,
            max_context_len: 30,
            max_response_len: 30,
            max_goal_len,
            max_knowledge_num,
            max_knowledge_len,
            dropout: default_dropout(),
            transformer_layer_norm: false,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = std::fs::read_to_string(path)?;
        let config: KpnConfig = serde_json::from_str(&config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("emb_size", self.emb_size),
            ("hidden_size", self.hidden_size),
            ("n_layer", self.n_layer),
            ("max_goal_len", self.max_goal_len),
            ("max_knowledge_num", self.max_knowledge_num),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, size)| *size == 0) {
            return Err(KpnError::InvalidConfig(format!("{name} must be positive")));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(KpnError::InvalidConfig(format!(
                "dropout {} is outside [0, 1)",
                self.dropout
            )));
        }

        let grids = [
            ("max_context_len", self.max_context_len, match_grid_len(self.max_context_len)),
            ("max_response_len", self.max_response_len, style_grid_len(self.max_response_len)),
            ("max_context_len", self.max_context_len, style_grid_len(self.max_context_len)),
            ("max_knowledge_len", self.max_knowledge_len, match_grid_len(self.max_knowledge_len)),
        ];
        for (name, len, reduced) in grids {
            if reduced.is_none() {
                return Err(KpnError::InvalidConfig(format!(
                    "{name} = {len} is too short for the matching convolutions"
                )));
            }
        }
        Ok(())
    }

    /// Flattened width of the context-vs-response matching grid.
    pub fn context_match_features(&self) -> usize {
        MATCH_CHANNELS
            * match_grid_len(self.max_context_len).unwrap_or(0)
            * match_grid_len(self.max_response_len).unwrap_or(0)
    }

    /// Flattened width of the knowledge-vs-response matching grid.
    pub fn knowledge_match_features(&self) -> usize {
        MATCH_CHANNELS
            * match_grid_len(self.max_knowledge_len).unwrap_or(0)
            * match_grid_len(self.max_response_len).unwrap_or(0)
    }

    /// Flattened width of the response-vs-previous-response grid.
    pub fn style_match_features(&self) -> usize {
        MATCH_CHANNELS
            * style_grid_len(self.max_response_len).unwrap_or(0)
            * style_grid_len(self.max_context_len).unwrap_or(0)
    }
}

// Each stage is a 3x3 valid convolution followed by a max-pool of the given size.
fn reduce(len: usize, pools: &[usize]) -> Option<usize> {
    pools.iter().try_fold(len, |len, pool| {
        let len = len.checked_sub(2)? / pool;
        (len > 0).then_some(len)
    })
}

fn match_grid_len(len: usize) -> Option<usize> {
    reduce(len, &[2, 2])
}

fn style_grid_len(len: usize) -> Option<usize> {
    reduce(len, &[2, 2, 3])
}

/// Runtime settings read from `kpn.ini`.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    pub dataset: String,
    pub device: String,
    pub embedding: String,
    pub embedding_tensor: String,
    pub model_config: Option<String>,
}

impl Settings {
    pub fn load() -> Self {
        Self::load_from(SETTINGS_FILE)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let conf = Ini::load_from_file(path).unwrap_or_default();
        Self::from_ini(&conf)
    }

    pub fn from_ini(conf: &Ini) -> Self {
        Self {
            dataset: conf.get_str("dataset", DATASET_DUCONV),
            device: conf.get_str("device", DEFAULT_DEVICE),
            embedding: conf.get_str("embedding", DEFAULT_EMBEDDING),
            embedding_tensor: conf.get_str("embedding-tensor", DEFAULT_EMBEDDING_TENSOR),
            model_config: conf.get_opt("model-config"),
        }
    }

    pub fn preset(&self) -> Preset {
        Preset::from_dataset(&self.dataset)
    }

    pub fn model_config(&self) -> Result<KpnConfig> {
        match &self.model_config {
            Some(path) => KpnConfig::from_file(path),
            None => Ok(KpnConfig::preset(self.preset())),
        }
    }

    pub fn device(&self) -> Result<Device> {
        parse_device(&self.device)
    }
}

/// Parses `cpu`, `cuda`, `cuda:N`, `metal` or `metal:N`.
pub fn parse_device(name: &str) -> Result<Device> {
    let unknown = || KpnError::UnknownDevice(name.to_string());
    let (kind, ordinal) = match name.trim().split_once(':') {
        Some((kind, ordinal)) => (kind, usize::from_str(ordinal).map_err(|_| unknown())?),
        None => (name.trim(), 0),
    };
    let device = match kind {
        "cpu" => Device::Cpu,
        "cuda" => Device::new_cuda(ordinal)?,
        "metal" => Device::new_metal(ordinal)?,
        _ => return Err(unknown()),
    };
    Ok(device)
}

trait IniGetter {
    fn get_opt(&self, key: &str) -> Option<String>;
    fn get_str(&self, key: &str, default: &str) -> String;
}

impl IniGetter for Ini {
    fn get_opt(&self, key: &str) -> Option<String> {
        self.general_section()
            .get(key)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn get_str(&self, key: &str, default: &str) -> String {
        self.get_opt(key).unwrap_or_else(|| default.to_string())
    }
}
