use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

// Below this probability of the loss going down, a window counts as "no progress"
const PROBABILITY_OF_DECREASE: f64 = 0.51;

// Share of the largest losses the robust count ignores
const QUANTILE_DISCARD: f64 = 0.10;

/// Watches the per-batch loss and decides when training stopped making progress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressTracker {
    threshold: usize,
    losses: VecDeque<f64>,
}

impl ProgressTracker {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            losses: VecDeque::with_capacity(2 * threshold),
        }
    }

    pub fn record(&mut self, loss: f64) {
        self.losses.push_back(loss);
        while self.losses.len() > 2 * self.threshold {
            self.losses.pop_front();
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Same history under a new threshold, trimmed to what that threshold keeps.
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        while self.losses.len() > 2 * threshold {
            self.losses.pop_front();
        }
        self
    }

    pub fn steps_without_progress(&self) -> usize {
        count_steps_without_decrease(self.losses.iter().copied())
    }

    pub fn steps_without_progress_robust(&self) -> usize {
        count_steps_without_decrease_robust(self.losses.iter().copied())
    }

    /// True once `threshold` consecutive batches went by without a measurable decrease,
    /// both over every loss and with the largest losses left out. A single spike can
    /// fool the first count but not the second.
    pub fn plateaued(&self) -> bool {
        self.losses.len() >= self.threshold
            && self.steps_without_progress() >= self.threshold
            && self.steps_without_progress_robust() >= self.threshold
    }

    /// Mean of the last `n` recorded losses.
    pub fn recent_mean(&self, n: usize) -> Option<f64> {
        let n = n.min(self.losses.len());
        if n == 0 {
            return None;
        }
        Some(self.losses.iter().rev().take(n).sum::<f64>() / n as f64)
    }
}

// Walking back from the newest loss, find the longest suffix of the history over
// which we can't be confident the loss was going down.
pub fn count_steps_without_decrease(losses: impl DoubleEndedIterator<Item = f64>) -> usize {
    count_newest_first(losses.rev(), None)
}

/// Like [`count_steps_without_decrease`], but losses in the top 10% of the history
/// are left out of the fit. Skipped losses still count as steps.
pub fn count_steps_without_decrease_robust<I>(losses: I) -> usize
where
    I: DoubleEndedIterator<Item = f64> + Clone,
{
    let mut largest_first: Vec<f64> = losses.clone().collect();
    if largest_first.is_empty() {
        return 0;
    }
    largest_first.sort_unstable_by(|a, b| b.total_cmp(a));
    let discard = (largest_first.len() as f64 * QUANTILE_DISCARD) as usize;
    count_newest_first(losses.rev(), Some(largest_first[discard]))
}

fn count_newest_first(losses: impl Iterator<Item = f64>, cutoff: Option<f64>) -> usize {
    let mut fit = SlopeFit::default();
    let mut count = 0;
    for (steps, loss) in losses.enumerate() {
        if cutoff.map_or(true, |cutoff| loss <= cutoff) {
            fit.add(loss);
        }
        // Newest first, so a decreasing loss shows up as a positive slope here
        if fit.len() > 2 && fit.probability_slope_positive() < PROBABILITY_OF_DECREASE {
            count = steps + 1;
        }
    }
    count
}

// Least-squares line through (0, y0), (1, y1), ... built one point at a time.
// Co-moments are updated around the running means so flat input stays exactly flat.
#[derive(Default)]
struct SlopeFit {
    n: usize,
    mean_x: f64,
    mean_y: f64,
    sxx: f64,
    sxy: f64,
    syy: f64,
}

impl SlopeFit {
    fn add(&mut self, y: f64) {
        let x = self.n as f64;
        self.n += 1;
        let n = self.n as f64;

        let dx = x - self.mean_x;
        let dy = y - self.mean_y;
        self.mean_x += dx / n;
        self.mean_y += dy / n;
        self.sxx += dx * (x - self.mean_x);
        self.sxy += dx * (y - self.mean_y);
        self.syy += dy * (y - self.mean_y);
    }

    fn len(&self) -> usize {
        self.n
    }

    // P(slope > 0) under a normal approximation of the slope estimate
    fn probability_slope_positive(&self) -> f64 {
        let slope = self.sxy / self.sxx;
        let residual = (self.syy - slope * self.sxy).max(0.0);
        let slope_variance = residual / (self.n as f64 - 2.0) / self.sxx;

        if slope_variance <= 0.0 {
            return match slope.partial_cmp(&0.0) {
                Some(std::cmp::Ordering::Greater) => 1.0,
                Some(std::cmp::Ordering::Less) => 0.0,
                _ => 0.5,
            };
        }
        normal_cdf(slope / slope_variance.sqrt())
    }
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

// Abramowitz and Stegun 7.1.26, maximum error 1.5e-7
fn erf(x: f64) -> f64 {
    const P: f64 = 0.3275911;
    const A: [f64; 5] = [0.254829592, -0.284496736, 1.421413741, -1.453152027, 1.061405429];

    let t = 1.0 / (1.0 + P * x.abs());
    let poly = A.iter().rev().fold(0.0, |acc, a| acc * t + a);
    let y = 1.0 - poly * t * (-x * x).exp();
    y.copysign(x)
}
