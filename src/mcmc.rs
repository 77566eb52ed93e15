use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{SseResult, config_err};
use crate::model::RateModel;
use crate::ode::OdeSolver;
use crate::process::SseProcess;
use crate::progress::Progress;

fn default_iterations() -> usize {
    1_000
}

fn default_sample_every() -> usize {
    10
}

fn default_scale_window() -> f64 {
    1.0
}

fn default_prior_rate() -> f64 {
    1.0
}

/// Metropolis-Hastings over the free rates of a fixed tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McmcConfig {
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default)]
    pub burnin: usize,
    #[serde(default = "default_sample_every")]
    pub sample_every: usize,
    /// Width of the log-uniform multiplier used by the scale move.
    #[serde(default = "default_scale_window")]
    pub scale_window: f64,
    /// Rate of the exponential prior placed on every free parameter.
    #[serde(default = "default_prior_rate")]
    pub prior_rate: f64,
    /// Draw and record a stochastic character map on every n-th sample.
    #[serde(default)]
    pub map_every: Option<usize>,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            burnin: 0,
            sample_every: default_sample_every(),
            scale_window: default_scale_window(),
            prior_rate: default_prior_rate(),
            map_every: None,
        }
    }
}

impl McmcConfig {
    pub fn validate(&self) -> SseResult<()> {
        if self.sample_every == 0 {
            return config_err("sample_every must be at least 1");
        }
        if !(self.scale_window > 0.0 && self.scale_window.is_finite()) {
            return config_err(format!("scale_window must be positive, got {}", self.scale_window));
        }
        if !(self.prior_rate > 0.0 && self.prior_rate.is_finite()) {
            return config_err(format!("prior_rate must be positive, got {}", self.prior_rate));
        }
        if self.map_every == Some(0) {
            return config_err("map_every must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct McmcSample {
    pub iteration: usize,
    pub ln_likelihood: f64,
    pub ln_prior: f64,
    pub params: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simmap: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct McmcTrace {
    pub samples: Vec<McmcSample>,
    pub accepted: usize,
    pub proposed: usize,
}

impl McmcTrace {
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }
}

fn ln_prior(params: &[f64], rate: f64) -> f64 {
    params
        .iter()
        .map(|&x| if x < 0.0 { f64::NEG_INFINITY } else { rate.ln() - rate * x })
        .sum()
}

/// Parameters the scale move may touch. Zero entries (absent transitions or
/// events) stay fixed.
fn free_indices(params: &[f64]) -> Vec<usize> {
    (0..params.len()).filter(|&i| params[i] > 0.0).collect()
}

pub fn run_mcmc<S: OdeSolver, R: Rng + ?Sized>(
    process: &mut SseProcess<S>,
    config: &McmcConfig,
    rng: &mut R,
    show_progress: bool,
) -> SseResult<McmcTrace> {
    config.validate()?;
    let mut params = process.rates().pack_params();
    let free = free_indices(&params);
    if free.is_empty() {
        return config_err("no positive rate parameter to sample");
    }

    let mut current_lnl = process.ln_probability()?;
    let mut current_prior = ln_prior(&params, config.prior_rate);
    process.keep();
    info!(
        ln_likelihood = current_lnl,
        n_params = free.len(),
        iterations = config.iterations,
        "starting mcmc"
    );

    let progress = Progress::bar(show_progress, config.iterations as u64, "mcmc");
    let mut trace = McmcTrace {
        samples: Vec::new(),
        accepted: 0,
        proposed: 0,
    };
    let mut n_samples = 0usize;

    for iteration in 1..=config.iterations {
        let idx = free[rng.gen_range(0..free.len())];
        let ln_m = config.scale_window * (rng.gen_range(0.0..1.0) - 0.5);
        let mut proposal = params.clone();
        proposal[idx] *= ln_m.exp();

        let old_rates: RateModel = process.rates().clone();
        let mut new_rates = old_rates.clone();
        new_rates.unpack_params(&proposal)?;
        process.set_rates(new_rates)?;
        let lnl = process.ln_probability()?;
        let prior = ln_prior(&proposal, config.prior_rate);
        let ln_ratio = (lnl + prior) - (current_lnl + current_prior) + ln_m;

        trace.proposed += 1;
        let u: f64 = rng.gen_range(0.0..1.0);
        if ln_ratio.is_finite() && u.ln() < ln_ratio {
            process.keep();
            params = proposal;
            current_lnl = lnl;
            current_prior = prior;
            trace.accepted += 1;
        } else {
            process.restore();
            process.rates = old_rates;
        }

        if iteration > config.burnin && (iteration - config.burnin) % config.sample_every == 0 {
            n_samples += 1;
            let simmap = match config.map_every {
                Some(every) if n_samples % every == 0 => {
                    process.draw_stochastic_character_map(rng)?;
                    Some(process.simmap_newick())
                }
                _ => None,
            };
            trace.samples.push(McmcSample {
                iteration,
                ln_likelihood: current_lnl,
                ln_prior: current_prior,
                params: params.clone(),
                simmap,
            });
            debug!(iteration, ln_likelihood = current_lnl, "recorded sample");
        }
        progress.tick();
        if iteration % 50 == 0 {
            progress.chain_state(current_lnl, trace.acceptance_rate());
        }
    }

    progress.finish("done");
    info!(
        acceptance = trace.acceptance_rate(),
        samples = trace.samples.len(),
        "finished mcmc"
    );
    Ok(trace)
}
