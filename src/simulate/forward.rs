use rand::Rng;
use rand_distr::{Distribution, Exp};
use tracing::{debug, info};

use super::{SimNode, SimulatedTree, SimulationConfig, assemble};
use crate::error::{SseError, SseResult, config_err};
use crate::model::RateModel;
use crate::process::ProcessAge;
use crate::utils::sample_index;

/// Forward-time simulation of the process from the root (two lineages) or
/// the origin (one lineage).
pub struct ForwardSimulator {
    rates: RateModel,
    process_age: ProcessAge,
    config: SimulationConfig,
}

struct Lineage {
    parent: Option<usize>,
    state: usize,
    segment_start: f64,
    segments: Vec<(usize, f64)>,
}

enum Outcome {
    Done(Vec<SimNode>),
    Failed(&'static str),
}

impl ForwardSimulator {
    pub fn new(rates: &RateModel, process_age: ProcessAge, config: SimulationConfig) -> SseResult<Self> {
        config.validate()?;
        let rates = rates.clone().resolved()?;
        match (config.exact_lineages, process_age) {
            (None, ProcessAge::Origin(_)) => {
                return config_err(
                    "simulating to a fixed age needs a root age; only an origin age is configured",
                );
            }
            (Some(_), _) if rates.n_epochs() > 1 => {
                return config_err("tip-count conditioned simulation needs constant rates");
            }
            _ => {}
        }
        if !(process_age.age() > 0.0) {
            return config_err("process age must be positive");
        }
        Ok(Self {
            rates,
            process_age,
            config,
        })
    }

    pub fn simulate<R: Rng + ?Sized>(&self, rng: &mut R) -> SseResult<SimulatedTree> {
        for attempt in 1..=self.config.max_attempts {
            match self.simulate_once(rng)? {
                Outcome::Done(nodes) => {
                    let sim = assemble(&self.rates, nodes, self.config.prune_extinct)?;
                    if self.config.prune_extinct
                        && self.config.exact_lineages.is_none()
                        && (sim.tree.root_age() - self.process_age.age()).abs() > 1e-9
                    {
                        debug!(attempt, "a root lineage died out; retrying");
                        continue;
                    }
                    info!(attempt, tips = sim.tree.num_tips(), "simulated tree");
                    return Ok(sim);
                }
                Outcome::Failed(reason) => debug!(attempt, reason, "simulation attempt failed"),
            }
        }
        Err(SseError::SamplingExhausted {
            what: "forward tree simulation",
            attempts: self.config.max_attempts,
        })
    }

    /// Epoch in force after `elapsed` time when running to a fixed age;
    /// tip-count runs use present-day rates throughout.
    fn epoch_for(&self, elapsed: f64) -> usize {
        match self.config.exact_lineages {
            Some(_) => 0,
            None => self.rates.epoch_index(self.process_age.age() - elapsed),
        }
    }

    fn simulate_once<R: Rng + ?Sized>(&self, rng: &mut R) -> SseResult<Outcome> {
        let k = self.rates.n_states();
        let target_age = self.process_age.age();
        let freqs = self.rates.root_frequencies();
        let mut nodes: Vec<SimNode> = Vec::new();
        let mut live: Vec<Lineage> = Vec::new();

        match self.process_age {
            ProcessAge::Root(_) => {
                let events = self.rates.epoch(self.epoch_for(0.0)).speciation.events();
                let weights: Vec<f64> = events.iter().map(|e| freqs[e.ancestor] * e.rate).collect();
                let Some(idx) = sample_index(rng, &weights) else {
                    return config_err("no speciation event has positive weight at the root");
                };
                let ev = events[idx];
                nodes.push(SimNode {
                    name: None,
                    age: 0.0,
                    parent: None,
                    state: ev.ancestor,
                    extinct: false,
                    segments: Vec::new(),
                });
                for state in [ev.left, ev.right] {
                    live.push(Lineage {
                        parent: Some(0),
                        state,
                        segment_start: 0.0,
                        segments: Vec::new(),
                    });
                }
            }
            ProcessAge::Origin(_) => {
                let Some(state) = sample_index(rng, &freqs) else {
                    return config_err("root frequencies have no positive entry");
                };
                live.push(Lineage {
                    parent: None,
                    state,
                    segment_start: 0.0,
                    segments: Vec::new(),
                });
            }
        }

        // `t` is elapsed time since the start; ages are filled in at the end.
        let mut t = 0.0;
        let present;
        loop {
            let epoch_idx = self.epoch_for(t);
            let epoch = self.rates.epoch(epoch_idx);
            let lambda = epoch.speciation.total_rates(k);
            let q_out: Vec<f64> = (0..k).map(|i| self.rates.total_anagenetic(epoch_idx, i)).collect();
            let state_rate: Vec<f64> = (0..k).map(|i| lambda[i] + epoch.extinction[i] + q_out[i]).collect();
            let mut counts = vec![0usize; k];
            for l in &live {
                counts[l.state] += 1;
            }
            let total: f64 = (0..k).map(|i| state_rate[i] * counts[i] as f64).sum();
            let wait = if total > 0.0 {
                Exp::new(total)
                    .map_err(|e| SseError::Config(format!("invalid event rate {total}: {e}")))?
                    .sample(rng)
            } else {
                f64::INFINITY
            };

            if let Some(n) = self.config.exact_lineages
                && live.len() >= n
            {
                // Present falls uniformly inside the interval with n lineages.
                let span = if wait.is_finite() { wait } else { 0.0 };
                present = t + rng.gen_range(0.0..1.0) * span;
                break;
            }
            if live.is_empty() {
                return Ok(Outcome::Failed("all lineages went extinct"));
            }

            let next = t + wait;
            if self.config.exact_lineages.is_none() {
                // Rates change at epoch boundaries; restart the clock there.
                let boundary = target_age - self.rates.epoch_start(epoch_idx);
                if epoch_idx > 0 && next > boundary && boundary > t {
                    t = boundary;
                    continue;
                }
                if next >= target_age {
                    present = target_age;
                    break;
                }
            } else if !next.is_finite() {
                return Ok(Outcome::Failed("process stalled before reaching the tip count"));
            }
            t = next;

            let weights: Vec<f64> = (0..k).map(|i| state_rate[i] * counts[i] as f64).collect();
            let Some(state) = sample_index(rng, &weights) else {
                return Ok(Outcome::Failed("no event could be drawn"));
            };
            let members: Vec<usize> = (0..live.len()).filter(|&i| live[i].state == state).collect();
            let pick = members[rng.gen_range(0..members.len())];

            let kinds = [epoch.extinction[state], lambda[state], q_out[state]];
            match sample_index(rng, &kinds) {
                Some(0) => {
                    let l = live.swap_remove(pick);
                    close_lineage(&mut nodes, l, t, true);
                }
                Some(1) => {
                    let events = epoch.speciation.events();
                    let here: Vec<_> = events.iter().filter(|e| e.ancestor == state).copied().collect();
                    let w: Vec<f64> = here.iter().map(|e| e.rate).collect();
                    let Some(ev_idx) = sample_index(rng, &w) else {
                        return Ok(Outcome::Failed("no daughter states could be drawn"));
                    };
                    let ev = here[ev_idx];
                    let l = live.swap_remove(pick);
                    let node = close_lineage(&mut nodes, l, t, false);
                    for s in [ev.left, ev.right] {
                        live.push(Lineage {
                            parent: Some(node),
                            state: s,
                            segment_start: t,
                            segments: Vec::new(),
                        });
                    }
                }
                Some(_) => {
                    let q: Vec<f64> = (0..k)
                        .map(|j| if j == state { 0.0 } else { self.rates.anagenetic_rate(epoch_idx, state, j) })
                        .collect();
                    let Some(new_state) = sample_index(rng, &q) else {
                        return Ok(Outcome::Failed("no anagenetic target state"));
                    };
                    let l = &mut live[pick];
                    l.segments.push((l.state, t - l.segment_start));
                    l.segment_start = t;
                    l.state = new_state;
                }
                None => return Ok(Outcome::Failed("no event type has positive rate")),
            }

            if live.len() > self.config.max_lineages {
                return Ok(Outcome::Failed("exceeded the maximum number of lineages"));
            }
        }

        let n_extant = live.len();
        if n_extant < self.config.min_lineages || n_extant > self.config.max_lineages {
            return Ok(Outcome::Failed("number of surviving lineages outside the bounds"));
        }
        if self.config.prune_extinct && n_extant < 2 {
            return Ok(Outcome::Failed("fewer than two surviving lineages"));
        }
        for l in live {
            close_lineage(&mut nodes, l, present, false);
        }
        if nodes.len() < 3 {
            return Ok(Outcome::Failed("tree has fewer than two tips"));
        }

        let mut n_sp = 0;
        let mut n_ex = 0;
        let is_tip = tip_flags(&nodes);
        for (i, node) in nodes.iter_mut().enumerate() {
            node.age = (present - node.age).max(0.0);
            if is_tip[i] {
                if node.extinct {
                    n_ex += 1;
                    node.name = Some(format!("ex{n_ex}"));
                } else {
                    n_sp += 1;
                    node.name = Some(format!("sp{n_sp}"));
                }
            }
        }
        Ok(Outcome::Done(nodes))
    }
}

/// Ends a lineage at elapsed time `t`, creating its node. The node's age
/// temporarily holds the elapsed time.
fn close_lineage(nodes: &mut Vec<SimNode>, mut l: Lineage, t: f64, extinct: bool) -> usize {
    l.segments.push((l.state, t - l.segment_start));
    l.segments.reverse();
    nodes.push(SimNode {
        name: None,
        age: t,
        parent: l.parent,
        state: l.state,
        extinct,
        segments: l.segments,
    });
    nodes.len() - 1
}

fn tip_flags(nodes: &[SimNode]) -> Vec<bool> {
    let mut tip = vec![true; nodes.len()];
    for n in nodes {
        if let Some(p) = n.parent {
            tip[p] = false;
        }
    }
    tip
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SpeciationRates;
    use crate::utils::new_rng;

    fn rates() -> RateModel {
        RateModel::constant(vec![0.1, 0.2], SpeciationRates::Flat(vec![1.0, 0.8]))
    }

    #[test]
    fn origin_without_tip_count_is_rejected() {
        let r = rates();
        let res = ForwardSimulator::new(&r, ProcessAge::Origin(2.0), SimulationConfig::default());
        assert!(matches!(res, Err(SseError::Config(_))));
    }

    #[test]
    fn tip_count_conditioning_hits_target() {
        let r = rates();
        let cfg = SimulationConfig {
            exact_lineages: Some(12),
            prune_extinct: true,
            ..SimulationConfig::default()
        };
        let sim = ForwardSimulator::new(&r, ProcessAge::Root(1.0), cfg).unwrap();
        let mut rng = new_rng(11);
        let out = sim.simulate(&mut rng).unwrap();
        assert_eq!(out.tree.num_tips(), 12);
        assert_eq!(out.data.len(), 12);
    }
}
