use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:.bold} [{elapsed_precise}] {bar:40.green/white} {pos:>6}/{len:6} {msg} ETA {eta}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:.bold} {spinner:.green} {msg} [{elapsed_precise}]")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("|/-\\ ")
}

/// Optional stderr progress display; a disabled one ignores every call.
#[derive(Debug, Default)]
pub struct Progress {
    pb: Option<ProgressBar>,
}

impl Progress {
    pub fn hidden() -> Self {
        Self { pb: None }
    }

    /// Bar for loops of known length (mcmc iterations, simulation replicates).
    pub fn bar(enabled: bool, len: u64, prefix: &str) -> Self {
        if !enabled {
            return Self::hidden();
        }
        let pb = ProgressBar::with_draw_target(Some(len), ProgressDrawTarget::stderr_with_hz(10));
        pb.set_style(bar_style());
        pb.set_prefix(prefix.to_string());
        Self { pb: Some(pb) }
    }

    /// Spinner for a single open-ended run such as a tip-conditioned simulation.
    pub fn spinner(enabled: bool, prefix: &str, msg: &str) -> Self {
        if !enabled {
            return Self::hidden();
        }
        let pb = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr_with_hz(10));
        pb.set_style(spinner_style());
        pb.set_prefix(prefix.to_string());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb: Some(pb) }
    }

    pub fn tick(&self) {
        if let Some(pb) = &self.pb {
            pb.inc(1);
        }
    }

    /// Shows the current chain state next to the bar.
    pub fn chain_state(&self, ln_likelihood: f64, acceptance: f64) {
        if let Some(pb) = &self.pb {
            pb.set_message(format!("lnL {ln_likelihood:.3} acc {:.0}%", 100.0 * acceptance));
        }
    }

    pub fn finish(self, msg: &str) {
        if let Some(pb) = self.pb {
            pb.finish_with_message(msg.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_progress_ignores_updates() {
        let p = Progress::bar(false, 10, "mcmc");
        p.tick();
        p.chain_state(-12.5, 0.3);
        assert!(p.pb.is_none());
        p.finish("done");
    }
}
