pub mod backward;
pub mod forward;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::{CharacterData, TipState};
use crate::error::{SseResult, config_err};
use crate::history::CharacterHistory;
use crate::model::RateModel;
use crate::ode::OdeSolver;
use crate::process::SseProcess;
use crate::tree::{Tree, TreeNode};

pub use backward::TipConditionedSimulator;
pub use forward::ForwardSimulator;

fn default_min_lineages() -> usize {
    2
}

fn default_max_lineages() -> usize {
    100_000
}

fn default_max_attempts() -> usize {
    100_000
}

fn default_max_time() -> f64 {
    1_000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_min_lineages")]
    pub min_lineages: usize,
    #[serde(default = "default_max_lineages")]
    pub max_lineages: usize,
    /// Stop as soon as this many lineages exist instead of running to the
    /// configured age.
    #[serde(default)]
    pub exact_lineages: Option<usize>,
    #[serde(default)]
    pub prune_extinct: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Simulate backward from the observed tip states instead of forward.
    #[serde(default)]
    pub condition_on_tips: bool,
    /// Age budget for backward simulation; also sets the decay scale of the
    /// backward extinction rate.
    #[serde(default = "default_max_time")]
    pub max_time: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            min_lineages: default_min_lineages(),
            max_lineages: default_max_lineages(),
            exact_lineages: None,
            prune_extinct: false,
            max_attempts: default_max_attempts(),
            condition_on_tips: false,
            max_time: default_max_time(),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> SseResult<()> {
        if self.min_lineages > self.max_lineages {
            return config_err(format!(
                "minimum number of lineages ({}) exceeds the maximum ({})",
                self.min_lineages, self.max_lineages
            ));
        }
        if let Some(n) = self.exact_lineages
            && n < 2
        {
            return config_err(format!(
                "exact number of lineages must be at least 2, got {n}"
            ));
        }
        if self.max_attempts == 0 {
            return config_err("simulation needs at least one attempt");
        }
        if !(self.max_time.is_finite() && self.max_time > 0.0) {
            return config_err(format!("max_time must be positive, got {}", self.max_time));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedTree {
    pub tree: Tree,
    pub data: CharacterData,
    pub history: CharacterHistory,
}

/// Node under construction: the lineage ending here carries `segments`
/// (tip-ward first).
#[derive(Debug, Clone)]
pub(crate) struct SimNode {
    pub name: Option<String>,
    pub age: f64,
    pub parent: Option<usize>,
    pub state: usize,
    pub extinct: bool,
    pub segments: Vec<(usize, f64)>,
}

/// Turns simulated nodes into a tree, its tip data and its history,
/// optionally dropping extinct lineages.
pub(crate) fn assemble(
    rates: &RateModel,
    nodes: Vec<SimNode>,
    prune_extinct: bool,
) -> SseResult<SimulatedTree> {
    let k = rates.n_states();
    let tree_nodes: Vec<TreeNode> = nodes
        .iter()
        .map(|n| {
            let mut tn = TreeNode::internal(n.age, n.parent);
            tn.name = n.name.clone();
            tn
        })
        .collect();
    let full = Tree::new(tree_nodes)?;

    let (tree, segments, states): (Tree, Vec<Vec<(usize, f64)>>, Vec<usize>) = if prune_extinct {
        let keep: Vec<bool> = nodes.iter().map(|n| !n.extinct).collect();
        let pruned = full.prune(&keep)?;
        let segments = pruned
            .merged
            .iter()
            .map(|olds| olds.iter().flat_map(|&o| nodes[o].segments.iter().copied()).collect())
            .collect();
        let states = pruned
            .merged
            .iter()
            .map(|olds| olds.first().map(|&o| nodes[o].state).unwrap_or(0))
            .collect();
        (pruned.tree, segments, states)
    } else {
        (
            full,
            nodes.iter().map(|n| n.segments.clone()).collect(),
            nodes.iter().map(|n| n.state).collect(),
        )
    };

    let mut history = CharacterHistory::new(tree.n_nodes(), k);
    let mut data = CharacterData::new();
    for i in 0..tree.n_nodes() {
        let segs = merge_adjacent(&segments[i]);
        let bl = tree.branch_length(i);
        let epoch = rates.epoch_at(tree.age(i));
        let lambda = epoch.speciation.total_rates(k);
        let (mut spec, mut ext) = (0.0, 0.0);
        for &(s, d) in &segs {
            history.time_in_states[s] += d;
            spec += lambda[s] * d;
            ext += epoch.extinction[s] * d;
        }
        if bl > 0.0 {
            history.average_speciation[i] = spec / bl;
            history.average_extinction[i] = ext / bl;
        } else {
            history.average_speciation[i] = lambda[states[i]];
            history.average_extinction[i] = epoch.extinction[states[i]];
        }
        history.num_shifts[i] = segs.len().saturating_sub(1);
        history.segments[i] = if segs.is_empty() {
            vec![(states[i], bl)]
        } else {
            segs
        };
        if tree.is_tip(i) {
            data.insert(tree.tip_label(i), TipState::Observed(states[i]));
        }
    }
    Ok(SimulatedTree {
        tree,
        data,
        history,
    })
}

/// Joins consecutive segments in the same state, which appear where pruning
/// concatenates branches.
fn merge_adjacent(segments: &[(usize, f64)]) -> Vec<(usize, f64)> {
    let mut out: Vec<(usize, f64)> = Vec::with_capacity(segments.len());
    for &(s, d) in segments {
        match out.last_mut() {
            Some(last) if last.0 == s => last.1 += d,
            _ => out.push((s, d)),
        }
    }
    out
}

impl<S: OdeSolver> SseProcess<S> {
    /// Replaces the tree with a simulated one: forward from the process age,
    /// or backward from the current tip states when conditioning on them.
    pub fn redraw<R: Rng + ?Sized>(&mut self, sim: &SimulationConfig, rng: &mut R) -> SseResult<()> {
        let simulated = if sim.condition_on_tips {
            TipConditionedSimulator::new(&self.rates, sim.clone())?.simulate(&self.data, rng)?
        } else {
            ForwardSimulator::new(&self.rates, self.config.process_age, sim.clone())?.simulate(rng)?
        };
        if self.config.process_age.uses_origin() && simulated.tree.root_age() > self.config.process_age.age() {
            return config_err("simulated tree is older than the origin");
        }
        info!(
            tips = simulated.tree.num_tips(),
            root_age = simulated.tree.root_age(),
            "redrew tree"
        );
        let SimulatedTree {
            tree,
            data,
            history,
        } = simulated;
        self.set_value(tree)?;
        self.set_data(data);
        self.history = history;
        Ok(())
    }
}
