use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::mcmc::McmcConfig;
use crate::model::RateModel;
use crate::process::ProcessConfig;
use crate::simulate::SimulationConfig;

/// Everything needed to build a process and run the drivers on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub rates: RateModel,
    pub process: ProcessConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub mcmc: McmcConfig,
}

impl ModelConfig {
    /// Fills in default rate matrices and checks every section.
    pub fn resolved(mut self) -> Result<Self> {
        self.rates = self.rates.resolved().context("invalid rate model")?;
        self.simulation.validate().context("invalid simulation settings")?;
        self.mcmc.validate().context("invalid mcmc settings")?;
        Ok(self)
    }
}

pub fn save_config(path: &Path, config: &ModelConfig) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, config).with_context(|| format!("failed to write {path:?}"))?;
    Ok(())
}

pub fn load_config(path: &Path) -> Result<ModelConfig> {
    let content = super::read_to_string(path)?;
    let config: ModelConfig =
        serde_json::from_str(&content).with_context(|| format!("failed to parse {path:?}"))?;
    config.resolved().with_context(|| format!("invalid model in {path:?}"))
}
