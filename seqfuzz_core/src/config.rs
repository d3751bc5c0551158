use crate::error::StructureError;
use crate::fuzz::{FuzzSettings, RecordingPolicy};
use crate::learn::{DEFAULT_NGRAM_SIZE, LearnSettings};
use crate::structure::{DataSource, InjectedStructure, InjectionMethod};
use crate::transmit::TargetAddress;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

pub fn default_timeout_ms() -> u64 {
    2000
}

impl TargetSettings {
    pub fn address(&self) -> TargetAddress {
        TargetAddress::new(self.host.clone(), self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub max_iterations: Option<u64>,
    /// Wall-clock limit for a run; the CLI cancels the run once it passes.
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default)]
    pub recording: RecordingPolicy,
    /// Fixed seed for reproducible runs; drawn from the OS when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_threads")]
    pub threads: usize,
}

pub fn default_interval_ms() -> u64 {
    100
}
pub fn default_threads() -> usize {
    1
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_iterations: None,
            max_duration_secs: None,
            recording: RecordingPolicy::default(),
            seed: None,
            threads: default_threads(),
        }
    }
}

impl FuzzerSettings {
    pub fn fuzz_settings(&self, target: &TargetAddress) -> FuzzSettings {
        FuzzSettings {
            interval: Duration::from_millis(self.interval_ms),
            policy: self.recording,
            max_iterations: self.max_iterations,
            target: target.to_string(),
        }
    }
}

/// Injection settings for one variable block.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct VariableInjection {
    /// Position among the variable blocks, counting from 0.
    pub index: usize,
    /// Library to draw values from; random bytes when absent.
    #[serde(default)]
    pub library: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct InjectionSettings {
    #[serde(default)]
    pub method: InjectionMethod,
    #[serde(default)]
    pub variable: Vec<VariableInjection>,
}

impl InjectionSettings {
    /// Configures `structure` from these settings. Library paths are
    /// validated on the way. The method is set first so that, under
    /// `Simultaneous`, an entry for any variable block covers all of them.
    pub fn apply(&self, structure: &mut InjectedStructure) -> Result<(), StructureError> {
        structure.set_method(self.method);
        let variables = structure.variable_indices();
        for entry in &self.variable {
            let index = *variables
                .get(entry.index)
                .ok_or(StructureError::BlockOutOfRange(entry.index))?;
            match &entry.library {
                Some(path) => {
                    let lines = structure.set_library(index, path)?;
                    log::debug!(
                        "Variable block {} reads {} lines from {:?}",
                        entry.index,
                        lines,
                        path
                    );
                }
                None => structure.set_source(index, DataSource::Random)?,
            }
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LearnConfig {
    #[serde(default)]
    pub capture_paths: Vec<PathBuf>,
    #[serde(default = "default_ngram_size")]
    pub ngram_size: usize,
}

fn default_ngram_size() -> usize {
    DEFAULT_NGRAM_SIZE
}

impl Default for LearnConfig {
    fn default() -> Self {
        Self {
            capture_paths: Vec::new(),
            ngram_size: default_ngram_size(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./seqfuzz_output")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SeqfuzzConfig {
    #[serde(default)]
    pub target: Option<TargetSettings>,
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub injection: InjectionSettings,
    #[serde(default)]
    pub learn: LearnConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl SeqfuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config file {:?}: {:#}", path, e))
    }

    pub fn from_toml(content: &str) -> Result<Self, anyhow::Error> {
        let config: SeqfuzzConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if let Some(target) = &self.target {
            anyhow::ensure!(target.port != 0, "target.port must not be 0");
            anyhow::ensure!(target.timeout_ms > 0, "target.timeout-ms must be positive");
        }
        anyhow::ensure!(self.fuzzer.interval_ms > 0, "fuzzer.interval-ms must be positive");
        anyhow::ensure!(self.fuzzer.threads >= 1, "fuzzer.threads must be at least 1");
        anyhow::ensure!(self.learn.ngram_size >= 1, "learn.ngram-size must be at least 1");
        Ok(())
    }

    pub fn learn_settings(&self) -> LearnSettings {
        LearnSettings {
            ngram_size: self.learn.ngram_size,
            threads: self.fuzzer.threads,
        }
    }
}
