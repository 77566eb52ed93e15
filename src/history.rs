use std::fmt::Write as _;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::data::{CharacterData, TipState};
use crate::error::{SseError, SseResult};
use crate::integrate::slice_grid;
use crate::ode::{Direction, OdeSolver};
use crate::process::{ProcessAge, SseProcess};
use crate::utils::sample_index;

/// Per-node `(state, duration)` segments, tip-ward end first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CharacterHistory {
    pub segments: Vec<Vec<(usize, f64)>>,
    pub num_shifts: Vec<usize>,
    pub average_speciation: Vec<f64>,
    pub average_extinction: Vec<f64>,
    pub time_in_states: Vec<f64>,
}

impl CharacterHistory {
    pub fn new(n_nodes: usize, n_states: usize) -> Self {
        Self {
            segments: vec![Vec::new(); n_nodes],
            num_shifts: vec![0; n_nodes],
            average_speciation: vec![0.0; n_nodes],
            average_extinction: vec![0.0; n_nodes],
            time_in_states: vec![0.0; n_states],
        }
    }

    pub fn simmap(&self, node: usize) -> String {
        format_simmap(&self.segments[node])
    }

    pub fn total_shifts(&self) -> usize {
        self.num_shifts.iter().sum()
    }
}

pub fn format_simmap(segments: &[(usize, f64)]) -> String {
    let mut out = String::from("{");
    for (i, (state, duration)) in segments.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        let _ = write!(out, "{state},{duration}");
    }
    out.push('}');
    out
}

pub fn parse_simmap(s: &str) -> SseResult<Vec<(usize, f64)>> {
    let inner = s
        .trim()
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .ok_or_else(|| SseError::Config(format!("SIMMAP string '{s}' must be enclosed in braces")))?;
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(':')
        .map(|seg| {
            let (state, duration) = seg
                .split_once(',')
                .ok_or_else(|| SseError::Config(format!("bad SIMMAP segment '{seg}'")))?;
            let state = state
                .trim()
                .parse()
                .map_err(|_| SseError::Config(format!("bad SIMMAP state '{state}'")))?;
            let duration = duration
                .trim()
                .parse()
                .map_err(|_| SseError::Config(format!("bad SIMMAP duration '{duration}'")))?;
            Ok((state, duration))
        })
        .collect()
}

/// States at both ends of every branch: `start` just after the parent's
/// speciation event, `end` at the node itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AncestralStates {
    pub start: Vec<usize>,
    pub end: Vec<usize>,
}

/// Result of walking one branch tip-ward.
struct BranchWalk {
    state: usize,
    cond: Vec<f64>,
    segments: Vec<(usize, f64)>,
    segment_start: f64,
    last_slice: Option<(f64, f64)>,
    shifts: usize,
    speciation: f64,
    extinction: f64,
}

fn one_hot(cond: &mut [f64], k: usize, state: usize) {
    for (i, v) in cond[k..].iter_mut().enumerate() {
        *v = if i == state { 1.0 } else { 0.0 };
    }
}

impl<S: OdeSolver> SseProcess<S> {
    pub fn character_history(&self) -> &CharacterHistory {
        &self.history
    }

    pub fn average_speciation_rates(&self) -> &[f64] {
        &self.history.average_speciation
    }

    pub fn average_extinction_rates(&self) -> &[f64] {
        &self.history.average_extinction
    }

    pub fn num_shift_events(&self) -> &[usize] {
        &self.history.num_shifts
    }

    pub fn time_in_states(&self) -> &[f64] {
        &self.history.time_in_states
    }

    /// The tree with each node's sampled history as a
    /// `character_history` parameter.
    pub fn simmap_newick(&self) -> String {
        self.tree
            .to_newick_with(|i| Some(format!("character_history={}", self.history.simmap(i))))
    }

    /// Attaches observed tip states and redraws a character history
    /// consistent with them.
    pub fn clamp_character_data<R: Rng + ?Sized>(&mut self, data: CharacterData, rng: &mut R) -> SseResult<()> {
        data.check_covers(&self.tree)?;
        self.set_data(data);
        self.draw_stochastic_character_map(rng)
    }

    fn ensure_scored(&mut self) -> SseResult<()> {
        let ln = self.ln_probability()?;
        if ln.is_finite() {
            Ok(())
        } else {
            Err(SseError::Tree(
                "tree has zero probability under the process; cannot sample states".into(),
            ))
        }
    }

    /// Extinction probabilities at the parent end of `node`'s branch and a
    /// one-hot observation vector for `start_state`.
    fn branch_start(&self, parent_age: f64, start_state: usize) -> SseResult<Vec<f64>> {
        let k = self.n_states();
        let mut cond = self.integrator().extinction_at(parent_age)?;
        cond.resize(2 * k, 0.0);
        cond[k + start_state] = 1.0;
        Ok(cond)
    }

    /// Forward-conditional probabilities at `node` given the state at the
    /// start of its branch.
    fn branch_conditional(&self, node: usize, start_state: usize) -> SseResult<Vec<f64>> {
        let Some(parent) = self.tree.parent(node) else {
            return Err(SseError::Tree("root has no branch".into()));
        };
        let parent_age = self.tree.age(parent);
        let mut cond = self.branch_start(parent_age, start_state)?;
        if !self.tree.node(node).sampled_ancestor {
            self.integrator().integrate(
                &mut cond,
                parent_age,
                self.tree.age(node),
                Direction::Tipward,
                false,
            )?;
        }
        Ok(cond)
    }

    /// Root state weights: root frequencies, propagated from the origin
    /// down to the root when the process starts at an origin.
    fn root_prior(&self) -> SseResult<Vec<f64>> {
        let k = self.n_states();
        let freqs = self.rates.root_frequencies();
        match self.config.process_age {
            ProcessAge::Root(_) => Ok(freqs),
            ProcessAge::Origin(origin) => {
                let mut cond = self.integrator().extinction_at(origin)?;
                cond.extend_from_slice(&freqs);
                self.integrator().integrate(
                    &mut cond,
                    origin,
                    self.tree.root_age(),
                    Direction::Tipward,
                    false,
                )?;
                Ok(cond[k..].to_vec())
            }
        }
    }

    fn draw_triple<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        node: usize,
        weight: &[f64],
    ) -> Option<(usize, usize, usize)> {
        let terms = self.speciation_terms(node);
        let weights: Vec<f64> = terms.iter().map(|&(a, _, _, w)| weight[a] * w).collect();
        sample_index(rng, &weights).map(|i| (terms[i].0, terms[i].1, terms[i].2))
    }

    fn draw_tip_state<R: Rng + ?Sized>(&self, rng: &mut R, node: usize, cond: &[f64]) -> Option<usize> {
        let k = self.n_states();
        let state = self.data.state_or_missing(&self.tree.tip_label(node));
        if let TipState::Observed(s) = state {
            return Some(s);
        }
        let weights: Vec<f64> = (0..k)
            .map(|i| if state.allows(i) { cond[k + i] } else { 0.0 })
            .collect();
        sample_index(rng, &weights)
    }

    pub fn draw_joint_conditional_ancestral_states<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
    ) -> SseResult<AncestralStates> {
        self.ensure_scored()?;
        let attempts = self.config.max_sampling_attempts;
        for attempt in 1..=attempts {
            if let Some(states) = self.try_draw_ancestral_states(rng)? {
                if attempt > 1 {
                    debug!(attempt, "ancestral states drawn after retries");
                }
                return Ok(states);
            }
        }
        Err(SseError::SamplingExhausted {
            what: "joint ancestral states",
            attempts,
        })
    }

    fn try_draw_ancestral_states<R: Rng + ?Sized>(&self, rng: &mut R) -> SseResult<Option<AncestralStates>> {
        let n = self.tree.n_nodes();
        let k = self.n_states();
        let root = self.tree.root();
        let mut start = vec![0; n];
        let mut end = vec![0; n];

        let Some((a, l, r)) = self.draw_triple(rng, root, &self.root_prior()?) else {
            return Ok(None);
        };
        start[root] = a;
        end[root] = a;
        let children = self.tree.children(root);
        let mut stack = vec![(children[0], l), (children[1], r)];

        while let Some((node, s)) = stack.pop() {
            start[node] = s;
            let cond = self.branch_conditional(node, s)?;
            if self.tree.is_tip(node) {
                match self.draw_tip_state(rng, node, &cond) {
                    Some(x) => end[node] = x,
                    None => return Ok(None),
                }
            } else {
                let Some((a, l, r)) = self.draw_triple(rng, node, &cond[k..]) else {
                    return Ok(None);
                };
                end[node] = a;
                let children = self.tree.children(node);
                stack.push((children[0], l));
                stack.push((children[1], r));
            }
        }
        Ok(Some(AncestralStates { start, end }))
    }

    /// Samples a full character history, stored per branch and readable
    /// through the history accessors.
    pub fn draw_stochastic_character_map<R: Rng + ?Sized>(&mut self, rng: &mut R) -> SseResult<()> {
        self.ensure_scored()?;
        // The sliced pass writes into a scratch copy; the scored cache is put back afterwards.
        let scored_cache = self.cache.clone();
        self.sample_history = true;
        self.cache.flag_all_dirty();
        let sliced = self.ensure_scored();
        self.sample_history = false;
        let drawn = sliced.and_then(|()| self.draw_history(rng));
        self.cache = scored_cache;
        drawn
    }

    fn draw_history<R: Rng + ?Sized>(&mut self, rng: &mut R) -> SseResult<()> {
        let attempts = self.config.max_sampling_attempts;
        for attempt in 1..=attempts {
            if let Some(history) = self.try_map_history(rng)? {
                info!(
                    attempt,
                    shifts = history.total_shifts(),
                    "sampled stochastic character map"
                );
                self.history = history;
                return Ok(());
            }
        }
        Err(SseError::SamplingExhausted {
            what: "stochastic character map",
            attempts,
        })
    }

    fn try_map_history<R: Rng + ?Sized>(&self, rng: &mut R) -> SseResult<Option<CharacterHistory>> {
        let k = self.n_states();
        let root = self.tree.root();
        let root_age = self.tree.root_age();
        let mut hist = CharacterHistory::new(self.tree.n_nodes(), k);

        let root_triple = match self.config.process_age {
            ProcessAge::Root(_) => {
                let freqs = self.rates.root_frequencies();
                let Some(triple) = self.draw_triple(rng, root, &freqs) else {
                    return Ok(None);
                };
                hist.segments[root] = vec![(triple.0, 0.0)];
                let lambda = self.rates.epoch_at(root_age).speciation.total_rates(k);
                hist.average_speciation[root] = lambda[triple.0];
                hist.average_extinction[root] = self.rates.epoch_at(root_age).extinction[triple.0];
                triple
            }
            ProcessAge::Origin(origin) => {
                let freqs = self.rates.root_frequencies();
                let top = self.cache.partial(root);
                let weights: Vec<f64> = (0..k).map(|i| freqs[i] * top[k + i]).collect();
                let Some(s0) = sample_index(rng, &weights) else {
                    return Ok(None);
                };
                let Some(walk) = self.walk_branch(rng, root, s0, root_age, origin, &mut hist.time_in_states)?
                else {
                    return Ok(None);
                };
                let Some(triple) = self.draw_triple(rng, root, &walk.cond[k..]) else {
                    return Ok(None);
                };
                self.finish_branch(&mut hist, root, walk, triple.0, origin - root_age);
                triple
            }
        };

        let children = self.tree.children(root);
        let mut stack = vec![(children[0], root_triple.1), (children[1], root_triple.2)];
        while let Some((node, s)) = stack.pop() {
            let Some(parent) = self.tree.parent(node) else {
                continue;
            };
            let (young, old) = (self.tree.age(node), self.tree.age(parent));
            let Some(walk) = self.walk_branch(rng, node, s, young, old, &mut hist.time_in_states)? else {
                return Ok(None);
            };
            let end_state = if self.tree.is_tip(node) {
                match self.draw_tip_state(rng, node, &walk.cond) {
                    Some(x) => x,
                    None => return Ok(None),
                }
            } else {
                let Some((a, l, r)) = self.draw_triple(rng, node, &walk.cond[k..]) else {
                    return Ok(None);
                };
                let children = self.tree.children(node);
                stack.push((children[0], l));
                stack.push((children[1], r));
                a
            };
            if self.tree.node(node).sampled_ancestor && end_state != s {
                return Ok(None);
            }
            self.finish_branch(&mut hist, node, walk, end_state, old - young);
        }
        Ok(Some(hist))
    }

    /// Draws states along `node`'s slice grid; the last slice is left to the caller.
    fn walk_branch<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        node: usize,
        start_state: usize,
        young: f64,
        old: f64,
        time_in_states: &mut [f64],
    ) -> SseResult<Option<BranchWalk>> {
        let k = self.n_states();
        let mut cond = self.branch_start(old, start_state)?;
        let mut walk = BranchWalk {
            state: start_state,
            cond: Vec::new(),
            segments: Vec::new(),
            segment_start: old,
            last_slice: None,
            shifts: 0,
            speciation: 0.0,
            extinction: 0.0,
        };
        if self.tree.node(node).sampled_ancestor || !(old > young) {
            walk.cond = cond;
            return Ok(Some(walk));
        }

        let grid = slice_grid(young, old, self.dt);
        let partials = &self.branch_partials[node];
        let n = grid.len() - 1;
        let integ = self.integrator();
        for j in (1..n).rev() {
            integ.integrate(&mut cond, grid[j + 1], grid[j], Direction::Tipward, false)?;
            self.accumulate(&mut walk, time_in_states, grid[j], grid[j + 1]);
            let Some(backward) = partials.get(j - 1) else {
                return Err(SseError::Integration(format!(
                    "missing branch partials for node {node}; history sampling was not enabled"
                )));
            };
            let weights: Vec<f64> = (0..k).map(|i| cond[k + i] * backward[i]).collect();
            let Some(new_state) = sample_index(rng, &weights) else {
                return Ok(None);
            };
            if new_state != walk.state {
                walk.segments.push((walk.state, walk.segment_start - grid[j]));
                walk.segment_start = grid[j];
                walk.state = new_state;
                walk.shifts += 1;
            }
            one_hot(&mut cond, k, walk.state);
        }
        integ.integrate(&mut cond, grid[1], grid[0], Direction::Tipward, false)?;
        walk.last_slice = Some((grid[0], grid[1]));
        walk.cond = cond;
        Ok(Some(walk))
    }

    fn accumulate(&self, walk: &mut BranchWalk, time_in_states: &mut [f64], young: f64, old: f64) {
        let duration = old - young;
        let epoch = self.rates.epoch_at(0.5 * (young + old));
        let lambda = epoch.speciation.total_rates(self.n_states());
        time_in_states[walk.state] += duration;
        walk.speciation += lambda[walk.state] * duration;
        walk.extinction += epoch.extinction[walk.state] * duration;
    }

    fn finish_branch(
        &self,
        hist: &mut CharacterHistory,
        node: usize,
        mut walk: BranchWalk,
        end_state: usize,
        branch_length: f64,
    ) {
        if let Some((young, old)) = walk.last_slice {
            if end_state != walk.state {
                if walk.segment_start > old {
                    walk.segments.push((walk.state, walk.segment_start - old));
                    walk.segment_start = old;
                    walk.shifts += 1;
                } else if let Some(&(prev, d)) = walk.segments.last() {
                    // The state entered at `old` lasted no time: the shift into
                    // it is replaced by the shift into `end_state`.
                    if prev == end_state {
                        walk.segments.pop();
                        walk.segment_start += d;
                        walk.shifts -= 1;
                    }
                } else {
                    walk.shifts += 1;
                }
                walk.state = end_state;
            }
            self.accumulate(&mut walk, &mut hist.time_in_states, young, old);
            walk.segments.push((walk.state, walk.segment_start - young));
        } else {
            walk.segments.push((end_state, branch_length));
        }
        walk.segments.reverse();
        hist.segments[node] = walk.segments;
        hist.num_shifts[node] = walk.shifts;
        let epoch = self.rates.epoch_at(self.tree.age(node));
        let (spec, ext) = if branch_length > 0.0 {
            (walk.speciation / branch_length, walk.extinction / branch_length)
        } else {
            (
                epoch.speciation.total_rates(self.n_states())[end_state],
                epoch.extinction[end_state],
            )
        };
        hist.average_speciation[node] = spec;
        hist.average_extinction[node] = ext;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simmap_format_round_trips() {
        let segs = vec![(1, 0.25), (0, 1.5)];
        let s = format_simmap(&segs);
        assert_eq!(s, "{1,0.25:0,1.5}");
        assert_eq!(parse_simmap(&s).unwrap(), segs);
        assert!(parse_simmap("1,0.2").is_err());
        assert!(parse_simmap("{}").unwrap().is_empty());
    }
}
