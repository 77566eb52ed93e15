use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::mcmc::McmcTrace;
use crate::model::{RateModel, SpeciationRates};

#[derive(Debug, Clone, Serialize)]
pub struct LikelihoodSummary {
    pub ln_probability: f64,
    pub ln_tree_shape: f64,
    pub n_tips: usize,
    pub n_sampled_ancestors: usize,
    pub root_age: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapSummary {
    pub ln_probability: f64,
    pub total_shifts: usize,
    pub time_in_states: Vec<f64>,
    pub num_shifts: Vec<usize>,
    pub average_speciation: Vec<f64>,
    pub average_extinction: Vec<f64>,
    pub simmap_newick: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub replicate: usize,
    pub seed: u64,
    pub n_tips: usize,
    pub n_extinct: usize,
    pub root_age: f64,
    pub total_shifts: usize,
    pub time_in_states: Vec<f64>,
    pub newick: String,
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("failed to create output dir {parent:?}"))?;
    }
    Ok(())
}

/// Column names matching `RateModel::pack_params`.
pub fn param_names(rates: &RateModel) -> Vec<String> {
    let mut names = Vec::new();
    let multi = rates.n_epochs() > 1;
    for (e, epoch) in rates.epochs.iter().enumerate() {
        let tag = if multi { format!("[{e}]") } else { String::new() };
        for i in 0..epoch.extinction.len() {
            names.push(format!("mu{tag}[{i}]"));
        }
        match &epoch.speciation {
            SpeciationRates::Flat(lambda) => {
                for i in 0..lambda.len() {
                    names.push(format!("lambda{tag}[{i}]"));
                }
            }
            SpeciationRates::Cladogenetic(map) => {
                for ev in map.events() {
                    names.push(format!("clado{tag}[{},{},{}]", ev.ancestor, ev.left, ev.right));
                }
            }
        }
    }
    names.push("clock".to_string());
    names
}

pub fn write_trace_tsv(path: &Path, trace: &McmcTrace, names: &[String]) -> Result<()> {
    ensure_parent(path)?;
    let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
    let mut w = BufWriter::new(file);
    write!(w, "iteration\tln_likelihood\tln_prior")?;
    for n in names {
        write!(w, "\t{n}")?;
    }
    writeln!(w)?;
    for s in &trace.samples {
        write!(w, "{}\t{:.8}\t{:.8}", s.iteration, s.ln_likelihood, s.ln_prior)?;
        for p in &s.params {
            write!(w, "\t{p:.8e}")?;
        }
        writeln!(w)?;
    }
    w.flush()?;
    Ok(())
}

/// One SIMMAP-annotated tree per line for the samples that carry a map.
pub fn write_simmap_trees(path: &Path, trace: &McmcTrace) -> Result<usize> {
    ensure_parent(path)?;
    let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
    let mut w = BufWriter::new(file);
    let mut n = 0;
    for s in &trace.samples {
        if let Some(tree) = &s.simmap {
            writeln!(w, "{}\t{tree}", s.iteration)?;
            n += 1;
        }
    }
    w.flush()?;
    Ok(n)
}

pub fn write_summary_json<T: Serialize>(path: &Path, summary: &T) -> Result<()> {
    ensure_parent(path)?;
    let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, summary).with_context(|| format!("failed to write {path:?}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CladogeneticEventMap;

    #[test]
    fn names_follow_packing_order() {
        let rates = RateModel::constant(vec![0.1, 0.2], SpeciationRates::Flat(vec![1.0, 2.0]));
        let names = param_names(&rates);
        assert_eq!(names, vec!["mu[0]", "mu[1]", "lambda[0]", "lambda[1]", "clock"]);
        assert_eq!(names.len(), rates.pack_params().len());
    }

    #[test]
    fn cladogenetic_names_list_triples() {
        let mut map = CladogeneticEventMap::new();
        map.insert(0, 0, 1, 0.5);
        map.insert(0, 0, 0, 1.0);
        let rates = RateModel::constant(vec![0.1, 0.1], SpeciationRates::Cladogenetic(map));
        let names = param_names(&rates);
        assert_eq!(names.len(), rates.pack_params().len());
        assert!(names.contains(&"clado[0,0,1]".to_string()));
    }
}
