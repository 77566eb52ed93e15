use crate::error::SseResult;
use crate::model::RateModel;
use crate::ode::{Direction, OdeSolver, SseOde};

/// Ages `young = a_0 < a_1 < ... < a_n = old` spaced by `dt`, with a
/// shorter final slice when the interval is not a multiple of `dt`.
pub fn slice_grid(young: f64, old: f64, dt: f64) -> Vec<f64> {
    let span = old - young;
    if !(span > 0.0) || !(dt > 0.0) {
        return vec![young];
    }
    let n = ((span / dt) - 1e-9).ceil().max(1.0) as usize;
    let mut grid: Vec<f64> = (0..n).map(|j| young + j as f64 * dt).collect();
    grid.push(old);
    grid
}

pub fn clamp_nonnegative(state: &mut [f64]) {
    for v in state.iter_mut() {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
}

/// Integrates the ClaSSE system along a branch, splitting at epoch
/// boundaries and clamping round-off after every segment.
pub struct BranchIntegrator<'a, S: OdeSolver> {
    rates: &'a RateModel,
    solver: &'a S,
    step: f64,
}

impl<'a, S: OdeSolver> BranchIntegrator<'a, S> {
    pub fn new(rates: &'a RateModel, solver: &'a S, step: f64) -> Self {
        Self { rates, solver, step }
    }

    pub fn rates(&self) -> &RateModel {
        self.rates
    }

    /// Rootward needs `begin_age <= end_age`, tipward `begin_age >= end_age`.
    pub fn integrate(
        &self,
        state: &mut [f64],
        begin_age: f64,
        end_age: f64,
        direction: Direction,
        extinction_only: bool,
    ) -> SseResult<()> {
        let mut epoch = self.rates.epoch_index(begin_age);
        let mut age = begin_age;
        match direction {
            Direction::Rootward => {
                while age < end_age {
                    let seg_end = end_age.min(self.rates.epoch_end(epoch));
                    if seg_end > age {
                        let ode = SseOde::new(self.rates, epoch, direction, extinction_only);
                        self.solver.integrate(
                            |_t, x: &[f64], dx: &mut [f64]| ode.derivative(x, dx),
                            state,
                            age,
                            seg_end,
                            self.step,
                        )?;
                        clamp_nonnegative(state);
                        age = seg_end;
                    }
                    epoch += 1;
                }
            }
            Direction::Tipward => {
                while age > end_age {
                    let seg_end = end_age.max(self.rates.epoch_start(epoch));
                    if seg_end < age {
                        let ode = SseOde::new(self.rates, epoch, direction, extinction_only);
                        self.solver.integrate(
                            |_t, x: &[f64], dx: &mut [f64]| ode.derivative(x, dx),
                            state,
                            begin_age - age,
                            begin_age - seg_end,
                            self.step,
                        )?;
                        clamp_nonnegative(state);
                        age = seg_end;
                    }
                    if epoch == 0 {
                        break;
                    }
                    epoch -= 1;
                }
            }
        }
        Ok(())
    }

    /// Rootward integration over `grid`, returning the observation half of
    /// the state at `grid[1..]`.
    pub fn integrate_slices(&self, state: &mut [f64], grid: &[f64]) -> SseResult<Vec<Vec<f64>>> {
        let k = state.len() / 2;
        let mut slices = Vec::with_capacity(grid.len().saturating_sub(1));
        for w in grid.windows(2) {
            self.integrate(state, w[0], w[1], Direction::Rootward, false)?;
            slices.push(state[k..].to_vec());
        }
        Ok(slices)
    }

    /// Extinction probabilities at `age` for a lineage observed with
    /// probability `rho` at the present.
    pub fn extinction_at(&self, age: f64) -> SseResult<Vec<f64>> {
        let k = self.rates.n_states();
        let rho = self.rates.sampling_probability;
        let mut state = vec![1.0 - rho; k];
        state.extend(std::iter::repeat_n(rho, k));
        self.integrate(&mut state, 0.0, age, Direction::Rootward, true)?;
        state.truncate(k);
        Ok(state)
    }
}
