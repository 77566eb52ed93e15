use rand::Rng;
use rand_distr::{Distribution, Exp};
use tracing::{debug, info};

use super::{SimNode, SimulatedTree, SimulationConfig, assemble};
use crate::data::{CharacterData, TipState};
use crate::error::{SseError, SseResult, config_err};
use crate::model::RateModel;
use crate::utils::sample_index;

/// Simulates a tree backward in time from observed tip states until all
/// lineages coalesce. Event times come from thinning an exponential
/// envelope; the extinction rate decays with age on the scale of
/// `max_time` so that hidden extinct branches become rare deep in time.
pub struct TipConditionedSimulator {
    rates: RateModel,
    config: SimulationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Event {
    Merge(usize),
    Relabel { from: usize, to: usize },
    HiddenExtinction(usize),
}

struct Lineage {
    node: usize,
    state: usize,
    segment_start: f64,
    segments: Vec<(usize, f64)>,
}

impl TipConditionedSimulator {
    pub fn new(rates: &RateModel, config: SimulationConfig) -> SseResult<Self> {
        config.validate()?;
        let rates = rates.clone().resolved()?;
        if rates.is_cladogenetic() {
            return config_err("tip-conditioned simulation does not support cladogenetic events");
        }
        Ok(Self { rates, config })
    }

    pub fn simulate<R: Rng + ?Sized>(&self, data: &CharacterData, rng: &mut R) -> SseResult<SimulatedTree> {
        let mut tips = Vec::with_capacity(data.len());
        for (taxon, state) in data.iter() {
            match state {
                TipState::Observed(s) if *s < self.rates.n_states() => tips.push((taxon.clone(), *s)),
                _ => {
                    return config_err(format!(
                        "tip-conditioned simulation needs an unambiguous state for '{taxon}'"
                    ));
                }
            }
        }
        if tips.len() < 2 {
            return config_err("tip-conditioned simulation needs at least two tips");
        }

        for attempt in 1..=self.config.max_attempts {
            match self.simulate_once(&tips, rng)? {
                Some(nodes) => {
                    let sim = assemble(&self.rates, nodes, false)?;
                    info!(attempt, root_age = sim.tree.root_age(), "simulated tip-conditioned tree");
                    return Ok(sim);
                }
                None => debug!(attempt, "lineages did not coalesce within max_time"),
            }
        }
        Err(SseError::SamplingExhausted {
            what: "tip-conditioned tree simulation",
            attempts: self.config.max_attempts,
        })
    }

    fn decayed_extinction(&self, epoch: usize, state: usize, age: f64) -> f64 {
        self.rates.epoch(epoch).extinction[state] * (-age / self.config.max_time).exp()
    }

    fn event_rates(&self, epoch: usize, counts: &[usize], age: f64) -> Vec<(Event, f64)> {
        let k = counts.len();
        let rates = self.rates.epoch(epoch);
        let lambda = rates.speciation.total_rates(k);
        let mut out = Vec::new();
        for i in 0..k {
            let n = counts[i] as f64;
            if counts[i] >= 2 {
                out.push((Event::Merge(i), lambda[i] * n * (n - 1.0) / 2.0));
            }
            if counts[i] == 0 {
                continue;
            }
            for j in 0..k {
                if j != i {
                    // Backward in time a lineage in state i came from j.
                    let r = self.rates.anagenetic_rate(epoch, j, i);
                    out.push((Event::Relabel { from: i, to: j }, n * r));
                }
            }
            if !self.config.prune_extinct {
                let mu = self.decayed_extinction(epoch, i, age);
                let p_lost = 1.0 - (-mu * age).exp();
                out.push((Event::HiddenExtinction(i), n * lambda[i] * p_lost));
            }
        }
        out
    }

    /// Upper bound on the total event rate at any age for these counts.
    fn envelope(&self, counts: &[usize]) -> f64 {
        let k = counts.len();
        (0..self.rates.n_epochs())
            .map(|e| {
                let lambda = self.rates.epoch(e).speciation.total_rates(k);
                let mut total = 0.0;
                for i in 0..k {
                    let n = counts[i] as f64;
                    total += lambda[i] * n * (n - 1.0).max(0.0) / 2.0;
                    for j in 0..k {
                        if j != i {
                            total += n * self.rates.anagenetic_rate(e, j, i);
                        }
                    }
                    if !self.config.prune_extinct {
                        total += n * lambda[i];
                    }
                }
                total
            })
            .fold(0.0, f64::max)
    }

    fn simulate_once<R: Rng + ?Sized>(&self, tips: &[(String, usize)], rng: &mut R) -> SseResult<Option<Vec<SimNode>>> {
        let k = self.rates.n_states();
        let mut nodes: Vec<SimNode> = Vec::with_capacity(2 * tips.len());
        let mut live: Vec<Lineage> = Vec::with_capacity(tips.len());
        for (name, state) in tips {
            live.push(Lineage {
                node: nodes.len(),
                state: *state,
                segment_start: 0.0,
                segments: Vec::new(),
            });
            nodes.push(SimNode {
                name: Some(name.clone()),
                age: 0.0,
                parent: None,
                state: *state,
                extinct: false,
                segments: Vec::new(),
            });
        }

        let mut n_extinct = 0;
        let mut age = 0.0;
        while live.len() > 1 {
            let mut counts = vec![0usize; k];
            for l in &live {
                counts[l.state] += 1;
            }
            let envelope = self.envelope(&counts);
            if !(envelope > 0.0) {
                return Ok(None);
            }
            age += Exp::new(envelope)
                .map_err(|e| SseError::Config(format!("invalid envelope rate {envelope}: {e}")))?
                .sample(rng);
            if age > self.config.max_time {
                return Ok(None);
            }

            let epoch = self.rates.epoch_index(age);
            let events = self.event_rates(epoch, &counts, age);
            let weights: Vec<f64> = events.iter().map(|(_, r)| *r).collect();
            let total: f64 = weights.iter().sum();
            if rng.gen_range(0.0..envelope) >= total {
                continue;
            }
            let Some(idx) = sample_index(rng, &weights) else {
                continue;
            };

            match events[idx].0 {
                Event::Merge(state) => {
                    let members: Vec<usize> = (0..live.len()).filter(|&i| live[i].state == state).collect();
                    let a = rng.gen_range(0..members.len());
                    let mut b = rng.gen_range(0..members.len() - 1);
                    if b >= a {
                        b += 1;
                    }
                    let (first, second) = (members[a].max(members[b]), members[a].min(members[b]));
                    let l1 = live.swap_remove(first);
                    let l2 = live.swap_remove(second);
                    let parent = join(&mut nodes, [l1, l2], state, age);
                    live.push(Lineage {
                        node: parent,
                        state,
                        segment_start: age,
                        segments: Vec::new(),
                    });
                }
                Event::Relabel { from, to } => {
                    let members: Vec<usize> = (0..live.len()).filter(|&i| live[i].state == from).collect();
                    let l = &mut live[members[rng.gen_range(0..members.len())]];
                    l.segments.push((l.state, age - l.segment_start));
                    l.segment_start = age;
                    l.state = to;
                }
                Event::HiddenExtinction(state) => {
                    let members: Vec<usize> = (0..live.len()).filter(|&i| live[i].state == state).collect();
                    let pick = members[rng.gen_range(0..members.len())];
                    let mu = self.decayed_extinction(epoch, state, age);
                    let lifetime = truncated_exponential(rng, mu, age);
                    n_extinct += 1;
                    let tip = nodes.len();
                    nodes.push(SimNode {
                        name: Some(format!("ex{n_extinct}")),
                        age: age - lifetime,
                        parent: None,
                        state,
                        extinct: true,
                        segments: Vec::new(),
                    });
                    let sister = Lineage {
                        node: tip,
                        state,
                        segment_start: age - lifetime,
                        segments: Vec::new(),
                    };
                    let l = live.swap_remove(pick);
                    let parent = join(&mut nodes, [l, sister], state, age);
                    live.push(Lineage {
                        node: parent,
                        state,
                        segment_start: age,
                        segments: Vec::new(),
                    });
                }
            }
        }
        Ok(Some(nodes))
    }
}

/// Closes two lineages at `age` under a new parent node and returns it.
fn join(nodes: &mut Vec<SimNode>, children: [Lineage; 2], state: usize, age: f64) -> usize {
    let parent = nodes.len();
    nodes.push(SimNode {
        name: None,
        age,
        parent: None,
        state,
        extinct: false,
        segments: Vec::new(),
    });
    for mut l in children {
        l.segments.push((l.state, age - l.segment_start));
        let child = &mut nodes[l.node];
        child.parent = Some(parent);
        child.segments = l.segments;
    }
    parent
}

/// Lifetime in `(0, max)` from an exponential with rate `mu` conditioned on
/// ending before `max`.
fn truncated_exponential<R: Rng + ?Sized>(rng: &mut R, mu: f64, max: f64) -> f64 {
    let u: f64 = rng.gen_range(f64::EPSILON..1.0);
    if mu * max < 1e-12 {
        return u * max;
    }
    let x = -(1.0 - u * (1.0 - (-mu * max).exp())).ln() / mu;
    x.min(max * (1.0 - f64::EPSILON))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CladogeneticEventMap, SpeciationRates};
    use crate::utils::new_rng;

    #[test]
    fn cladogenetic_models_are_rejected() {
        let r = RateModel::constant(
            vec![0.1],
            SpeciationRates::Cladogenetic(CladogeneticEventMap::from_flat(&[1.0])),
        );
        assert!(TipConditionedSimulator::new(&r, SimulationConfig::default()).is_err());
    }

    #[test]
    fn truncated_lifetimes_stay_inside_window() {
        let mut rng = new_rng(3);
        for _ in 0..1000 {
            let x = truncated_exponential(&mut rng, 2.0, 0.5);
            assert!(x > 0.0 && x < 0.5);
        }
    }
}
