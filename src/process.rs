use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::PartialLikelihoodCache;
use crate::data::{CharacterData, TipState};
use crate::error::{SseError, SseResult, config_err};
use crate::history::CharacterHistory;
use crate::integrate::{BranchIntegrator, slice_grid};
use crate::model::RateModel;
use crate::ode::{Direction, Dopri5, OdeSolver};
use crate::tree::{ListenerId, Tree};
use crate::utils::ln_factorial;

const AGE_TOL: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessAge {
    Root(f64),
    Origin(f64),
}

impl ProcessAge {
    pub fn age(&self) -> f64 {
        match *self {
            Self::Root(a) | Self::Origin(a) => a,
        }
    }

    pub fn uses_origin(&self) -> bool {
        matches!(self, Self::Origin(_))
    }

    pub fn num_initial_lineages(&self) -> usize {
        if self.uses_origin() { 1 } else { 2 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    None,
    #[default]
    Survival,
}

fn default_time_slices() -> usize {
    500
}

fn yes() -> bool {
    true
}

fn default_sampling_attempts() -> usize {
    20_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub process_age: ProcessAge,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default = "default_time_slices")]
    pub num_time_slices: usize,
    #[serde(default = "yes")]
    pub use_scaling: bool,
    /// Cap on whole-tree redraws when ancestral or history sampling hits a
    /// zero-probability draw.
    #[serde(default = "default_sampling_attempts")]
    pub max_sampling_attempts: usize,
}

impl ProcessConfig {
    pub fn new(process_age: ProcessAge) -> Self {
        Self {
            process_age,
            condition: Condition::default(),
            num_time_slices: default_time_slices(),
            use_scaling: true,
            max_sampling_attempts: default_sampling_attempts(),
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_scaling(mut self, use_scaling: bool) -> Self {
        self.use_scaling = use_scaling;
        self
    }

    pub fn with_time_slices(mut self, n: usize) -> Self {
        self.num_time_slices = n;
        self
    }

    pub fn with_max_sampling_attempts(mut self, n: usize) -> Self {
        self.max_sampling_attempts = n;
        self
    }

    fn validate(&self) -> SseResult<()> {
        let age = self.process_age.age();
        if !(age.is_finite() && age > 0.0) {
            return config_err(format!("process age must be positive, got {age}"));
        }
        if self.num_time_slices == 0 {
            return config_err("number of time slices must be at least 1");
        }
        Ok(())
    }
}

/// State-dependent speciation-extinction process on a time-tree it owns and
/// listens to.
pub struct SseProcess<S: OdeSolver = Dopri5> {
    pub(crate) tree: Tree,
    pub(crate) listener: ListenerId,
    pub(crate) data: CharacterData,
    pub(crate) rates: RateModel,
    pub(crate) config: ProcessConfig,
    pub(crate) solver: S,
    pub(crate) dt: f64,
    pub(crate) cache: PartialLikelihoodCache,
    pub(crate) sample_history: bool,
    pub(crate) branch_partials: Vec<Vec<Vec<f64>>>,
    pub(crate) history: CharacterHistory,
}

impl SseProcess<Dopri5> {
    pub fn new(tree: Tree, rates: RateModel, config: ProcessConfig) -> SseResult<Self> {
        Self::with_solver(tree, rates, config, Dopri5::default())
    }
}

impl<S: OdeSolver> SseProcess<S> {
    pub fn with_solver(mut tree: Tree, rates: RateModel, config: ProcessConfig, solver: S) -> SseResult<Self> {
        let rates = rates.resolved()?;
        config.validate()?;
        let k = rates.n_states();
        let n = tree.n_nodes();
        let listener = tree.events_mut().subscribe();
        let data = CharacterData::all_missing(&tree);
        let dt = config.process_age.age() / config.num_time_slices as f64;
        Ok(Self {
            tree,
            listener,
            data,
            rates,
            config,
            solver,
            dt,
            cache: PartialLikelihoodCache::new(n, k),
            sample_history: false,
            branch_partials: vec![Vec::new(); n],
            history: CharacterHistory::new(n, k),
        })
    }

    pub fn n_states(&self) -> usize {
        self.rates.n_states()
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Mutations made through this handle reach the cache via the change
    /// subscription on the next likelihood request.
    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    pub fn listener(&self) -> ListenerId {
        self.listener
    }

    pub fn rates(&self) -> &RateModel {
        &self.rates
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn data(&self) -> &CharacterData {
        &self.data
    }

    pub fn cache(&self) -> &PartialLikelihoodCache {
        &self.cache
    }

    pub fn time_slice_width(&self) -> f64 {
        self.dt
    }

    pub fn set_num_time_slices(&mut self, n: usize) -> SseResult<()> {
        if n == 0 {
            return config_err("number of time slices must be at least 1");
        }
        self.config.num_time_slices = n;
        self.dt = self.config.process_age.age() / n as f64;
        Ok(())
    }

    pub fn set_use_scaling(&mut self, use_scaling: bool) {
        if self.config.use_scaling != use_scaling {
            self.config.use_scaling = use_scaling;
            self.touch();
        }
    }

    /// Replaces the rate parameters and invalidates every node.
    pub fn set_rates(&mut self, rates: RateModel) -> SseResult<()> {
        let rates = rates.resolved()?;
        if rates.n_states() != self.n_states() {
            return config_err(format!(
                "new rates have {} states, process has {}",
                rates.n_states(),
                self.n_states()
            ));
        }
        self.rates = rates;
        self.touch();
        Ok(())
    }

    pub fn set_data(&mut self, data: CharacterData) {
        self.data = data;
        for tip in self.tree.tips() {
            self.fire_tree_change(tip);
        }
    }

    pub fn set_tip_state(&mut self, taxon: &str, state: TipState) -> SseResult<()> {
        let tip = self.tree.tip_index(taxon).ok_or_else(|| SseError::TaxonMismatch {
            taxon: taxon.to_string(),
        })?;
        self.data.insert(taxon, state);
        self.fire_tree_change(tip);
        Ok(())
    }

    /// Marks `node` and all its ancestors dirty.
    pub fn fire_tree_change(&mut self, node: usize) {
        if node >= self.cache.len() {
            return;
        }
        let mut cur = Some(node);
        while let Some(i) = cur {
            if !self.cache.flag_dirty(i) {
                break;
            }
            cur = self.tree.parent(i);
        }
    }

    /// A parameter changed: every node must be recomputed.
    pub fn touch(&mut self) {
        self.cache.flag_all_dirty();
    }

    pub fn keep(&mut self) {
        self.cache.keep();
    }

    pub fn restore(&mut self) {
        self.cache.restore();
    }

    /// Swaps in a replacement tree, moving the change subscription to it and
    /// resetting caches and tip data.
    pub fn set_value(&mut self, tree: Tree) -> SseResult<()> {
        self.tree.events_mut().unsubscribe(self.listener);
        self.tree = tree;
        self.listener = self.tree.events_mut().subscribe();
        if let ProcessAge::Root(_) = self.config.process_age {
            self.config.process_age = ProcessAge::Root(self.tree.root_age());
            self.dt = self.tree.root_age() / self.config.num_time_slices as f64;
        }
        self.resize();
        self.data = CharacterData::all_missing(&self.tree);
        Ok(())
    }

    pub fn into_tree(mut self) -> Tree {
        self.tree.events_mut().unsubscribe(self.listener);
        self.tree
    }

    pub(crate) fn resize(&mut self) {
        let n = self.tree.n_nodes();
        let k = self.n_states();
        debug!(nodes = n, states = k, "resizing likelihood cache");
        self.cache.resize(n, k);
        self.branch_partials = vec![Vec::new(); n];
        self.history = CharacterHistory::new(n, k);
    }

    pub(crate) fn integrator(&self) -> BranchIntegrator<'_, S> {
        BranchIntegrator::new(&self.rates, &self.solver, self.dt)
    }

    pub fn ln_probability(&mut self) -> SseResult<f64> {
        for node in self.tree.events_mut().take(self.listener) {
            self.fire_tree_change(node);
        }
        if self.cache.len() != self.tree.n_nodes() {
            self.resize();
        }
        if let Some(reason) = self.reject_reason() {
            debug!(reason, "tree rejected by the process");
            return Ok(f64::NEG_INFINITY);
        }

        let mut ln_prob = 0.0;
        if self.config.condition == Condition::Survival {
            let p = self.p_survival(0.0, self.config.process_age.age())?;
            if !(p > 0.0) {
                return Ok(f64::NEG_INFINITY);
            }
            ln_prob -= self.config.process_age.num_initial_lineages() as f64 * p.ln();
        }
        ln_prob += self.compute_root_likelihood()?;
        ln_prob += self.ln_prob_tree_shape();
        Ok(ln_prob)
    }

    fn reject_reason(&self) -> Option<&'static str> {
        let tree = &self.tree;
        let root = tree.root();
        if tree.is_tip(root) {
            return Some("root is a tip");
        }
        for (i, node) in tree.nodes().iter().enumerate() {
            if let Some(p) = node.parent
                && node.age > tree.age(p) + AGE_TOL
            {
                return Some("node older than its parent");
            }
            if node.sampled_ancestor {
                if !node.fossil {
                    return Some("sampled ancestor not flagged as fossil");
                }
                if tree.branch_length(i) > AGE_TOL {
                    return Some("sampled ancestor with positive branch length");
                }
            }
        }
        match self.config.process_age {
            ProcessAge::Root(age) => {
                if tree.children(root).iter().any(|&c| tree.node(c).sampled_ancestor) {
                    return Some("sampled ancestor at the root under root conditioning");
                }
                if (tree.root_age() - age).abs() > AGE_TOL * age.max(1.0) {
                    return Some("tree root age differs from the process root age");
                }
            }
            ProcessAge::Origin(origin) => {
                if tree.root_age() > origin + AGE_TOL {
                    return Some("root older than the origin");
                }
            }
        }
        None
    }

    /// Converts an oriented labelled tree density into one over unlabelled
    /// ranked trees.
    pub fn ln_prob_tree_shape(&self) -> f64 {
        let tips = self.tree.num_tips() as f64;
        let extinct = self.tree.num_extinct_tips();
        let sa = self.tree.num_sampled_ancestors() as f64;
        let living = self.tree.num_tips() - extinct;
        (tips - extinct as f64 - sa - 1.0) * std::f64::consts::LN_2 - ln_factorial(living)
    }

    /// Extinction (first half) and observation (second half) probabilities
    /// integrated from `start` to `end`, starting from the present-day
    /// sampling probability.
    pub fn p_extinction(&self, start: f64, end: f64) -> SseResult<Vec<f64>> {
        let k = self.n_states();
        let rho = self.rates.sampling_probability;
        let mut state = vec![1.0 - rho; k];
        state.extend(std::iter::repeat_n(rho, k));
        self.integrator()
            .integrate(&mut state, start, end, Direction::Rootward, true)?;
        Ok(state)
    }

    pub fn p_survival(&self, start: f64, end: f64) -> SseResult<f64> {
        let e = self.p_extinction(start, end)?;
        let freqs = self.rates.root_frequencies();
        let p_ext: f64 = freqs.iter().zip(&e).map(|(f, e)| f * e).sum();
        Ok(1.0 - p_ext)
    }

    /// A node whose children include a sampled ancestor is not a speciation
    /// event when fossils are sampled through time.
    pub(crate) fn is_speciation_node(&self, node: usize) -> bool {
        let has_sa_child = self
            .tree
            .children(node)
            .iter()
            .any(|&c| self.tree.node(c).sampled_ancestor);
        !(has_sa_child && self.rates.uses_serial_sampling())
    }

    /// (ancestor, left, right, weight) merge terms at `node`.
    pub(crate) fn speciation_terms(&self, node: usize) -> Vec<(usize, usize, usize, f64)> {
        let k = self.n_states();
        let (l, r) = match self.tree.children(node) {
            [l, r] => (*l, *r),
            _ => return Vec::new(),
        };
        let left = self.cache.partial(l);
        let right = self.cache.partial(r);
        if self.is_speciation_node(node) {
            let epoch = self.rates.epoch_at(self.tree.age(node));
            epoch
                .speciation
                .events()
                .iter()
                .map(|e| (e.ancestor, e.left, e.right, e.rate * left[k + e.left] * right[k + e.right]))
                .collect()
        } else {
            (0..k).map(|i| (i, i, i, left[k + i] * right[k + i])).collect()
        }
    }

    fn merged_vector(&self, node: usize) -> Vec<f64> {
        let k = self.n_states();
        let mut x = vec![0.0; 2 * k];
        if let Some(&l) = self.tree.children(node).first() {
            x[..k].copy_from_slice(&self.cache.partial(l)[..k]);
        }
        for (a, _, _, w) in self.speciation_terms(node) {
            x[k + a] += w;
        }
        x
    }

    fn tip_vector(&self, node: usize) -> SseResult<Vec<f64>> {
        let k = self.n_states();
        let tip = self.tree.node(node);
        let state = self.data.state_or_missing(&self.tree.tip_label(node));
        let (extinction, sampling): (Vec<f64>, Vec<f64>) =
            if self.rates.uses_serial_sampling() && tip.fossil && tip.age > 0.0 {
                let mut e = self.p_extinction(0.0, tip.age)?;
                e.truncate(k);
                let epoch = self.rates.epoch_at(tip.age);
                (e, (0..k).map(|i| epoch.sampling_rate(i)).collect())
            } else {
                let rho = self.rates.sampling_probability;
                (vec![1.0 - rho; k], vec![rho; k])
            };
        let mut x = extinction;
        x.extend((0..k).map(|i| if state.allows(i) { sampling[i] } else { 0.0 }));
        Ok(x)
    }

    fn children_scale(&self, node: usize) -> f64 {
        self.tree
            .children(node)
            .iter()
            .map(|&c| self.cache.scale(c))
            .sum()
    }

    fn rescale(&self, x: &mut [f64], scale: &mut f64) {
        if !self.config.use_scaling {
            return;
        }
        let k = x.len() / 2;
        let max = x[k..].iter().copied().fold(0.0, f64::max);
        if max > 0.0 {
            for v in x[k..].iter_mut() {
                *v /= max;
            }
            *scale += max.ln();
        }
    }

    fn integrate_branch(&mut self, node: usize, x: &mut [f64], young: f64, old: f64) -> SseResult<()> {
        if self.sample_history {
            let grid = slice_grid(young, old, self.dt);
            let slices = self.integrator().integrate_slices(x, &grid)?;
            self.branch_partials[node] = slices;
        } else {
            self.integrator()
                .integrate(x, young, old, Direction::Rootward, false)?;
        }
        Ok(())
    }

    fn compute_node(&mut self, node: usize) -> SseResult<()> {
        let mut x = if self.tree.is_tip(node) {
            self.tip_vector(node)?
        } else {
            self.merged_vector(node)
        };
        let mut scale = self.children_scale(node);
        if self.tree.node(node).sampled_ancestor {
            self.branch_partials[node].clear();
        } else if let Some(parent) = self.tree.parent(node) {
            let (young, old) = (self.tree.age(node), self.tree.age(parent));
            self.integrate_branch(node, &mut x, young, old)?;
        }
        self.rescale(&mut x, &mut scale);
        self.cache.store(node, &x, scale);
        Ok(())
    }

    fn compute_root_likelihood(&mut self) -> SseResult<f64> {
        let root = self.tree.root();
        for node in self.tree.post_order() {
            if node != root && (self.cache.is_dirty(node) || self.sample_history) {
                self.compute_node(node)?;
            }
        }
        let mut x = self.merged_vector(root);
        let mut scale = self.children_scale(root);
        if let ProcessAge::Origin(origin) = self.config.process_age {
            let root_age = self.tree.root_age();
            self.integrate_branch(root, &mut x, root_age, origin)?;
            self.rescale(&mut x, &mut scale);
        } else {
            self.branch_partials[root].clear();
        }
        self.cache.store(root, &x, scale);

        let k = self.n_states();
        let freqs = self.rates.root_frequencies();
        let prob: f64 = freqs.iter().zip(&x[k..]).map(|(f, d)| f * d).sum();
        Ok(prob.ln() + scale)
    }
}
