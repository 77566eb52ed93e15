use std::borrow::Cow;

use crate::error::{SseError, SseResult};
use crate::model::{CladoEvent, RateMatrix, RateModel};

/// Which way along a branch the system is being integrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Age increases (tip to root); used for partial likelihoods.
    Rootward,
    /// Age decreases (root to tip); used for ancestral states and mapping.
    Tipward,
}

/// ClaSSE derivative bound to the rates of one epoch.
///
/// The state vector holds `k` extinction probabilities `E` followed by `k`
/// observation densities `D`. Rootward, `D` follows the backward equation;
/// tipward, `E` runs in reverse age and `D` follows the forward equation, so
/// every state-to-state flux is transposed.
pub struct SseOde<'a> {
    extinction: &'a [f64],
    events: Cow<'a, [CladoEvent]>,
    no_event: Vec<f64>,
    anagenetic: Option<&'a RateMatrix>,
    clock_rate: f64,
    direction: Direction,
    extinction_only: bool,
}

impl<'a> SseOde<'a> {
    pub fn new(rates: &'a RateModel, epoch: usize, direction: Direction, extinction_only: bool) -> Self {
        let k = rates.n_states();
        let epoch_rates = rates.epoch(epoch);
        let lambda = epoch_rates.speciation.total_rates(k);
        let no_event = (0..k)
            .map(|i| {
                epoch_rates.extinction[i]
                    + lambda[i]
                    + epoch_rates.sampling_rate(i)
                    + rates.total_anagenetic(epoch, i)
            })
            .collect();
        Self {
            extinction: &epoch_rates.extinction,
            events: epoch_rates.speciation.events(),
            no_event,
            anagenetic: epoch_rates.anagenetic.as_ref(),
            clock_rate: rates.clock_rate,
            direction,
            extinction_only,
        }
    }

    pub fn n_states(&self) -> usize {
        self.extinction.len()
    }

    pub fn derivative(&self, x: &[f64], dxdt: &mut [f64]) {
        let k = self.n_states();
        let safe = |v: f64| v.max(0.0);
        let (e, d) = x.split_at(k);

        for i in 0..k {
            dxdt[i] = self.extinction[i] - self.no_event[i] * safe(e[i]);
            dxdt[k + i] = if self.extinction_only {
                0.0
            } else {
                -self.no_event[i] * safe(d[i])
            };
        }

        for ev in self.events.iter() {
            let (a, l, r) = (ev.ancestor, ev.left, ev.right);
            dxdt[a] += ev.rate * safe(e[l]) * safe(e[r]);
            if self.extinction_only {
                continue;
            }
            match self.direction {
                Direction::Rootward => {
                    dxdt[k + a] += ev.rate * (safe(d[l]) * safe(e[r]) + safe(d[r]) * safe(e[l]));
                }
                Direction::Tipward => {
                    dxdt[k + l] += ev.rate * safe(d[a]) * safe(e[r]);
                    dxdt[k + r] += ev.rate * safe(d[a]) * safe(e[l]);
                }
            }
        }

        if let Some(q) = self.anagenetic {
            for i in 0..k {
                for j in 0..k {
                    if i == j {
                        continue;
                    }
                    dxdt[i] += self.clock_rate * q.rate(i, j) * safe(e[j]);
                    if !self.extinction_only {
                        let r = match self.direction {
                            Direction::Rootward => q.rate(i, j),
                            Direction::Tipward => q.rate(j, i),
                        };
                        dxdt[k + i] += self.clock_rate * r * safe(d[j]);
                    }
                }
            }
        }

        if self.direction == Direction::Tipward {
            for v in dxdt[..k].iter_mut() {
                *v = -*v;
            }
        }
    }
}

/// Adaptive initial-value solver over `[t0, t1]`, updating `y` in place.
pub trait OdeSolver {
    fn integrate<F>(&self, f: F, y: &mut [f64], t0: f64, t1: f64, initial_step: f64) -> SseResult<()>
    where
        F: FnMut(f64, &[f64], &mut [f64]);
}

/// Dormand–Prince 5(4) with local extrapolation and first-same-as-last reuse.
#[derive(Debug, Clone, Copy)]
pub struct Dopri5 {
    pub rtol: f64,
    pub atol: f64,
    pub max_steps: usize,
}

impl Default for Dopri5 {
    fn default() -> Self {
        Self {
            rtol: 1e-7,
            atol: 1e-7,
            max_steps: 200_000,
        }
    }
}

const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;
const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;
const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;
const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

impl OdeSolver for Dopri5 {
    fn integrate<F>(&self, mut f: F, y: &mut [f64], t0: f64, t1: f64, initial_step: f64) -> SseResult<()>
    where
        F: FnMut(f64, &[f64], &mut [f64]),
    {
        let span = t1 - t0;
        if span == 0.0 {
            return Ok(());
        }
        if !span.is_finite() || span < 0.0 {
            return Err(SseError::Integration(format!("invalid interval [{t0}, {t1}]")));
        }
        let n = y.len();
        let mut h = if initial_step.is_finite() && initial_step > 0.0 {
            initial_step.min(span)
        } else {
            span * 0.01
        };

        let mut k1 = vec![0.0; n];
        let mut k2 = vec![0.0; n];
        let mut k3 = vec![0.0; n];
        let mut k4 = vec![0.0; n];
        let mut k5 = vec![0.0; n];
        let mut k6 = vec![0.0; n];
        let mut k7 = vec![0.0; n];
        let mut tmp = vec![0.0; n];
        let mut y_new = vec![0.0; n];

        let mut t = t0;
        f(t, y, &mut k1);
        let mut steps = 0usize;
        while t < t1 {
            if steps >= self.max_steps {
                return Err(SseError::Integration(format!(
                    "exceeded {} steps integrating [{t0}, {t1}]",
                    self.max_steps
                )));
            }
            steps += 1;
            let last = t + h >= t1;
            if last {
                h = t1 - t;
            }

            for i in 0..n {
                tmp[i] = y[i] + h * A21 * k1[i];
            }
            f(t + C2 * h, &tmp, &mut k2);
            for i in 0..n {
                tmp[i] = y[i] + h * (A31 * k1[i] + A32 * k2[i]);
            }
            f(t + C3 * h, &tmp, &mut k3);
            for i in 0..n {
                tmp[i] = y[i] + h * (A41 * k1[i] + A42 * k2[i] + A43 * k3[i]);
            }
            f(t + C4 * h, &tmp, &mut k4);
            for i in 0..n {
                tmp[i] = y[i] + h * (A51 * k1[i] + A52 * k2[i] + A53 * k3[i] + A54 * k4[i]);
            }
            f(t + C5 * h, &tmp, &mut k5);
            for i in 0..n {
                tmp[i] = y[i]
                    + h * (A61 * k1[i] + A62 * k2[i] + A63 * k3[i] + A64 * k4[i] + A65 * k5[i]);
            }
            f(t + h, &tmp, &mut k6);
            for i in 0..n {
                y_new[i] = y[i]
                    + h * (B1 * k1[i] + B3 * k3[i] + B4 * k4[i] + B5 * k5[i] + B6 * k6[i]);
            }
            f(t + h, &y_new, &mut k7);

            let mut err_sq = 0.0;
            for i in 0..n {
                let e = h
                    * (E1 * k1[i] + E3 * k3[i] + E4 * k4[i] + E5 * k5[i] + E6 * k6[i] + E7 * k7[i]);
                let sc = self.atol + self.rtol * y[i].abs().max(y_new[i].abs());
                err_sq += (e / sc).powi(2);
            }
            let mut err = (err_sq / n.max(1) as f64).sqrt();
            if !err.is_finite() || y_new.iter().any(|v| !v.is_finite()) {
                err = f64::INFINITY;
            }

            let accepted = err <= 1.0;
            if accepted {
                t = if last { t1 } else { t + h };
                y.copy_from_slice(&y_new);
                std::mem::swap(&mut k1, &mut k7);
            }

            let mut factor = if err == 0.0 {
                5.0
            } else if err.is_infinite() {
                0.2
            } else {
                (0.9 * err.powf(-0.2)).clamp(0.2, 5.0)
            };
            if !accepted {
                factor = factor.min(1.0);
            }
            h *= factor;
            if t < t1 && h <= f64::EPSILON * t.abs().max(1.0) {
                return Err(SseError::Integration(format!("step size underflow at t = {t}")));
            }
        }
        Ok(())
    }
}
