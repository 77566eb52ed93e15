use std::borrow::Cow;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{SseError, SseResult, config_err};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CladoEvent {
    pub ancestor: usize,
    pub left: usize,
    pub right: usize,
    pub rate: f64,
}

impl CladoEvent {
    fn key(&self) -> (usize, usize, usize) {
        (self.ancestor, self.left, self.right)
    }
}

/// Sparse map from (ancestor, left, right) state triples to speciation rates.
/// Events are kept sorted by triple so that all events of one ancestor are
/// contiguous.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<(usize, usize, usize, f64)>", into = "Vec<(usize, usize, usize, f64)>")]
pub struct CladogeneticEventMap {
    events: Vec<CladoEvent>,
}

impl CladogeneticEventMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Self-to-self-to-self map equivalent to a flat speciation vector.
    pub fn from_flat(lambda: &[f64]) -> Self {
        let mut map = Self::new();
        for (i, &rate) in lambda.iter().enumerate() {
            map.insert(i, i, i, rate);
        }
        map
    }

    pub fn insert(&mut self, ancestor: usize, left: usize, right: usize, rate: f64) {
        let ev = CladoEvent {
            ancestor,
            left,
            right,
            rate,
        };
        match self.events.binary_search_by(|e| e.key().cmp(&ev.key())) {
            Ok(pos) => self.events[pos].rate = rate,
            Err(pos) => self.events.insert(pos, ev),
        }
    }

    pub fn rate(&self, ancestor: usize, left: usize, right: usize) -> f64 {
        self.events
            .binary_search_by(|e| e.key().cmp(&(ancestor, left, right)))
            .map(|pos| self.events[pos].rate)
            .unwrap_or(0.0)
    }

    pub fn events(&self) -> &[CladoEvent] {
        &self.events
    }

    pub fn events_from(&self, ancestor: usize) -> &[CladoEvent] {
        let lo = self.events.partition_point(|e| e.ancestor < ancestor);
        let hi = self.events.partition_point(|e| e.ancestor <= ancestor);
        &self.events[lo..hi]
    }

    pub fn total_rate(&self, ancestor: usize) -> f64 {
        self.events_from(ancestor).iter().map(|e| e.rate).sum()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn rates_mut(&mut self) -> impl Iterator<Item = &mut f64> {
        self.events.iter_mut().map(|e| &mut e.rate)
    }
}

impl From<Vec<(usize, usize, usize, f64)>> for CladogeneticEventMap {
    fn from(triples: Vec<(usize, usize, usize, f64)>) -> Self {
        let mut map = Self::new();
        for (a, l, r, rate) in triples {
            map.insert(a, l, r, rate);
        }
        map
    }
}

impl From<CladogeneticEventMap> for Vec<(usize, usize, usize, f64)> {
    fn from(map: CladogeneticEventMap) -> Self {
        map.events
            .into_iter()
            .map(|e| (e.ancestor, e.left, e.right, e.rate))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeciationRates {
    Flat(Vec<f64>),
    Cladogenetic(CladogeneticEventMap),
}

impl SpeciationRates {
    /// Speciation events as state triples; a flat vector yields `(i, i, i)`
    /// with rate `lambda_i`. Both the likelihood and the simulators read
    /// speciation through this.
    pub fn events(&self) -> Cow<'_, [CladoEvent]> {
        match self {
            Self::Flat(lambda) => Cow::Owned(
                lambda
                    .iter()
                    .enumerate()
                    .map(|(i, &rate)| CladoEvent {
                        ancestor: i,
                        left: i,
                        right: i,
                        rate,
                    })
                    .collect(),
            ),
            Self::Cladogenetic(map) => Cow::Borrowed(map.events()),
        }
    }

    pub fn total_rates(&self, n_states: usize) -> Vec<f64> {
        match self {
            Self::Flat(lambda) => lambda.clone(),
            Self::Cladogenetic(map) => (0..n_states).map(|i| map.total_rate(i)).collect(),
        }
    }

    pub fn is_cladogenetic(&self) -> bool {
        matches!(self, Self::Cladogenetic(_))
    }

    fn values_mut(&mut self) -> Box<dyn Iterator<Item = &mut f64> + '_> {
        match self {
            Self::Flat(lambda) => Box::new(lambda.iter_mut()),
            Self::Cladogenetic(map) => Box::new(map.rates_mut()),
        }
    }
}

/// Anagenetic rate generator. Off-diagonal entries are instantaneous rates,
/// the diagonal holds minus the row sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f64>>", into = "Vec<Vec<f64>>")]
pub struct RateMatrix {
    q: Array2<f64>,
}

impl RateMatrix {
    pub fn new(mut q: Array2<f64>) -> SseResult<Self> {
        let (n, m) = q.dim();
        if n != m {
            return config_err(format!("rate matrix must be square, got {n}x{m}"));
        }
        for i in 0..n {
            let mut row_sum = 0.0;
            for j in 0..n {
                if i == j {
                    continue;
                }
                let r = q[[i, j]];
                if !r.is_finite() || r < 0.0 {
                    return config_err(format!("rate matrix entry ({i},{j}) = {r} is invalid"));
                }
                row_sum += r;
            }
            q[[i, i]] = -row_sum;
        }
        Ok(Self { q })
    }

    pub fn jukes_cantor(n_states: usize) -> Self {
        let off = if n_states > 1 {
            1.0 / (n_states - 1) as f64
        } else {
            0.0
        };
        let mut q = Array2::from_elem((n_states, n_states), off);
        for i in 0..n_states {
            q[[i, i]] = -off * (n_states.saturating_sub(1)) as f64;
        }
        Self { q }
    }

    pub fn n_states(&self) -> usize {
        self.q.nrows()
    }

    pub fn rate(&self, from: usize, to: usize) -> f64 {
        self.q[[from, to]]
    }

    pub fn total_out(&self, from: usize) -> f64 {
        -self.q[[from, from]]
    }
}

impl TryFrom<Vec<Vec<f64>>> for RateMatrix {
    type Error = SseError;

    fn try_from(rows: Vec<Vec<f64>>) -> SseResult<Self> {
        let n = rows.len();
        if rows.iter().any(|r| r.len() != n) {
            return config_err("rate matrix rows must all have one entry per state");
        }
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let q = Array2::from_shape_vec((n, n), flat)
            .map_err(|e| SseError::Config(format!("rate matrix shape: {e}")))?;
        Self::new(q)
    }
}

impl From<RateMatrix> for Vec<Vec<f64>> {
    fn from(m: RateMatrix) -> Self {
        m.q.rows().into_iter().map(|r| r.to_vec()).collect()
    }
}

/// Rates in force over one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRates {
    pub extinction: Vec<f64>,
    pub speciation: SpeciationRates,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anagenetic: Option<RateMatrix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_sampling: Option<Vec<f64>>,
}

impl EpochRates {
    pub fn new(extinction: Vec<f64>, speciation: SpeciationRates) -> Self {
        Self {
            extinction,
            speciation,
            anagenetic: None,
            serial_sampling: None,
        }
    }

    pub fn with_anagenetic(mut self, q: RateMatrix) -> Self {
        self.anagenetic = Some(q);
        self
    }

    pub fn with_serial_sampling(mut self, psi: Vec<f64>) -> Self {
        self.serial_sampling = Some(psi);
        self
    }

    pub fn sampling_rate(&self, state: usize) -> f64 {
        self.serial_sampling
            .as_ref()
            .map(|psi| psi[state])
            .unwrap_or(0.0)
    }

    fn validate(&self, k: usize, index: usize) -> SseResult<()> {
        let check = |name: &str, v: &[f64]| -> SseResult<()> {
            if v.len() != k {
                return config_err(format!(
                    "epoch {index}: {name} has {} entries but the model has {k} states",
                    v.len()
                ));
            }
            if let Some(x) = v.iter().find(|x| !x.is_finite() || **x < 0.0) {
                return config_err(format!("epoch {index}: {name} contains invalid rate {x}"));
            }
            Ok(())
        };
        check("extinction", &self.extinction)?;
        match &self.speciation {
            SpeciationRates::Flat(lambda) => check("speciation", lambda)?,
            SpeciationRates::Cladogenetic(map) => {
                for e in map.events() {
                    if e.ancestor >= k || e.left >= k || e.right >= k {
                        return config_err(format!(
                            "epoch {index}: cladogenetic event ({},{},{}) out of range for {k} states",
                            e.ancestor, e.left, e.right
                        ));
                    }
                    if !e.rate.is_finite() || e.rate < 0.0 {
                        return config_err(format!("epoch {index}: invalid cladogenetic rate {}", e.rate));
                    }
                }
            }
        }
        if let Some(q) = &self.anagenetic
            && q.n_states() != k
        {
            return config_err(format!(
                "epoch {index}: rate matrix has {} states but the model has {k}",
                q.n_states()
            ));
        }
        if let Some(psi) = &self.serial_sampling {
            check("serial_sampling", psi)?;
        }
        Ok(())
    }
}

fn one() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateModel {
    pub epochs: Vec<EpochRates>,
    /// Ascending epoch boundary ages; one fewer than `epochs`.
    #[serde(default)]
    pub epoch_times: Vec<f64>,
    #[serde(default = "one")]
    pub clock_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_frequencies: Option<Vec<f64>>,
    #[serde(default = "one")]
    pub sampling_probability: f64,
}

impl RateModel {
    pub fn constant(extinction: Vec<f64>, speciation: SpeciationRates) -> Self {
        Self::time_varying(Vec::new(), vec![EpochRates::new(extinction, speciation)])
    }

    pub fn time_varying(epoch_times: Vec<f64>, epochs: Vec<EpochRates>) -> Self {
        Self {
            epochs,
            epoch_times,
            clock_rate: 1.0,
            root_frequencies: None,
            sampling_probability: 1.0,
        }
    }

    pub fn with_anagenetic(mut self, q: RateMatrix) -> Self {
        for epoch in self.epochs.iter_mut() {
            epoch.anagenetic = Some(q.clone());
        }
        self
    }

    pub fn with_serial_sampling(mut self, psi: Vec<f64>) -> Self {
        for epoch in self.epochs.iter_mut() {
            epoch.serial_sampling = Some(psi.clone());
        }
        self
    }

    pub fn with_root_frequencies(mut self, freqs: Vec<f64>) -> Self {
        self.root_frequencies = Some(freqs);
        self
    }

    pub fn with_clock_rate(mut self, clock_rate: f64) -> Self {
        self.clock_rate = clock_rate;
        self
    }

    pub fn with_sampling_probability(mut self, rho: f64) -> Self {
        self.sampling_probability = rho;
        self
    }

    pub fn n_states(&self) -> usize {
        match &self.root_frequencies {
            Some(f) => f.len(),
            None => self.epochs.first().map(|e| e.extinction.len()).unwrap_or(0),
        }
    }

    pub fn n_epochs(&self) -> usize {
        self.epochs.len()
    }

    /// Number of boundaries strictly younger than `age`.
    pub fn epoch_index(&self, age: f64) -> usize {
        let mut index = 0;
        while index < self.epoch_times.len() && age > self.epoch_times[index] {
            index += 1;
        }
        index
    }

    pub fn epoch_end(&self, index: usize) -> f64 {
        self.epoch_times.get(index).copied().unwrap_or(f64::INFINITY)
    }

    pub fn epoch_start(&self, index: usize) -> f64 {
        if index == 0 {
            0.0
        } else {
            self.epoch_times[index - 1]
        }
    }

    pub fn epoch(&self, index: usize) -> &EpochRates {
        &self.epochs[index.min(self.epochs.len() - 1)]
    }

    pub fn epoch_at(&self, age: f64) -> &EpochRates {
        self.epoch(self.epoch_index(age))
    }

    pub fn root_frequencies(&self) -> Vec<f64> {
        match &self.root_frequencies {
            Some(f) => f.clone(),
            None => {
                let k = self.n_states();
                vec![1.0 / k as f64; k]
            }
        }
    }

    pub fn uses_serial_sampling(&self) -> bool {
        self.epochs.iter().any(|e| e.serial_sampling.is_some())
    }

    pub fn is_cladogenetic(&self) -> bool {
        self.epochs.iter().any(|e| e.speciation.is_cladogenetic())
    }

    pub fn anagenetic_rate(&self, epoch: usize, from: usize, to: usize) -> f64 {
        self.epoch(epoch)
            .anagenetic
            .as_ref()
            .map(|q| q.rate(from, to) * self.clock_rate)
            .unwrap_or(0.0)
    }

    pub fn total_anagenetic(&self, epoch: usize, from: usize) -> f64 {
        self.epoch(epoch)
            .anagenetic
            .as_ref()
            .map(|q| q.total_out(from) * self.clock_rate)
            .unwrap_or(0.0)
    }

    /// Fills defaulted components and checks every dimension against the
    /// number of states.
    pub fn resolved(mut self) -> SseResult<Self> {
        let k = self.n_states();
        if k == 0 {
            return config_err("rate model needs at least one state");
        }
        if self.epochs.is_empty() {
            return config_err("rate model needs at least one epoch");
        }
        if self.epoch_times.len() + 1 != self.epochs.len() {
            return config_err(format!(
                "{} epoch times given for {} epochs",
                self.epoch_times.len(),
                self.epochs.len()
            ));
        }
        if self
            .epoch_times
            .windows(2)
            .any(|w| !(w[0] < w[1]))
            || self.epoch_times.iter().any(|t| !t.is_finite() || *t <= 0.0)
        {
            return config_err("epoch times must be positive and strictly increasing");
        }
        for epoch in self.epochs.iter_mut() {
            if epoch.anagenetic.is_none() {
                epoch.anagenetic = Some(RateMatrix::jukes_cantor(k));
            }
        }
        for (i, epoch) in self.epochs.iter().enumerate() {
            epoch.validate(k, i)?;
        }
        if self.epochs.iter().any(|e| e.serial_sampling.is_some())
            && self.epochs.iter().any(|e| e.serial_sampling.is_none())
        {
            return config_err("serial sampling must be given for every epoch or none");
        }
        if let Some(freqs) = &self.root_frequencies {
            if freqs.iter().any(|f| !f.is_finite() || *f < 0.0) {
                return config_err("root frequencies must be nonnegative");
            }
            let total: f64 = freqs.iter().sum();
            if (total - 1.0).abs() > 1e-6 {
                return config_err(format!("root frequencies sum to {total}, expected 1"));
            }
        }
        if !(self.clock_rate.is_finite() && self.clock_rate >= 0.0) {
            return config_err(format!("invalid clock rate {}", self.clock_rate));
        }
        if !(self.sampling_probability > 0.0 && self.sampling_probability <= 1.0) {
            return config_err(format!(
                "sampling probability {} must be in (0, 1]",
                self.sampling_probability
            ));
        }
        Ok(self)
    }

    /// Flattens the free rates: per epoch extinction then speciation, then
    /// the clock rate.
    pub fn pack_params(&self) -> Vec<f64> {
        let mut out = Vec::new();
        for epoch in &self.epochs {
            out.extend_from_slice(&epoch.extinction);
            out.extend(epoch.speciation.events().iter().map(|e| e.rate));
        }
        out.push(self.clock_rate);
        out
    }

    pub fn unpack_params(&mut self, params: &[f64]) -> SseResult<()> {
        let expected = self.pack_params().len();
        if params.len() != expected {
            return config_err(format!(
                "parameter vector has {} entries, expected {expected}",
                params.len()
            ));
        }
        let mut it = params.iter().copied();
        for epoch in self.epochs.iter_mut() {
            for (x, v) in epoch.extinction.iter_mut().zip(it.by_ref()) {
                *x = v;
            }
            for (x, v) in epoch.speciation.values_mut().zip(it.by_ref()) {
                *x = v;
            }
        }
        if let Some(clock) = it.next() {
            self.clock_rate = clock;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_lookup_counts_boundaries_below_age() {
        let e = EpochRates::new(vec![0.1], SpeciationRates::Flat(vec![1.0]));
        let m = RateModel::time_varying(vec![1.0, 2.5], vec![e.clone(), e.clone(), e]);
        assert_eq!(m.epoch_index(0.0), 0);
        assert_eq!(m.epoch_index(1.0), 0);
        assert_eq!(m.epoch_index(1.0001), 1);
        assert_eq!(m.epoch_index(3.0), 2);
        assert_eq!(m.epoch_end(1), 2.5);
        assert!(m.epoch_end(2).is_infinite());
    }

    #[test]
    fn event_map_groups_by_ancestor() {
        let mut map = CladogeneticEventMap::new();
        map.insert(1, 0, 1, 0.2);
        map.insert(0, 0, 0, 1.0);
        map.insert(1, 1, 1, 0.5);
        map.insert(1, 0, 1, 0.3);
        assert_eq!(map.len(), 3);
        assert_eq!(map.events_from(1).len(), 2);
        assert!((map.total_rate(1) - 0.8).abs() < 1e-12);
        assert_eq!(map.rate(2, 2, 2), 0.0);
    }

    #[test]
    fn resolve_rejects_length_mismatch() {
        let m = RateModel::constant(vec![0.1, 0.2], SpeciationRates::Flat(vec![1.0]));
        assert!(matches!(m.resolved(), Err(SseError::Config(_))));
    }

    #[test]
    fn pack_unpack_round_trips() {
        let mut m = RateModel::constant(vec![0.1, 0.2], SpeciationRates::Flat(vec![1.0, 2.0]))
            .resolved()
            .unwrap();
        let mut p = m.pack_params();
        assert_eq!(p, vec![0.1, 0.2, 1.0, 2.0, 1.0]);
        p[3] = 3.0;
        m.unpack_params(&p).unwrap();
        assert_eq!(m.epochs[0].speciation, SpeciationRates::Flat(vec![1.0, 3.0]));
    }

    #[test]
    fn jukes_cantor_rows_sum_to_zero() {
        let q = RateMatrix::jukes_cantor(3);
        for i in 0..3 {
            let s: f64 = (0..3).map(|j| q.rate(i, j)).sum();
            assert!(s.abs() < 1e-12);
            assert!((q.total_out(i) - 1.0).abs() < 1e-12);
        }
    }
}
