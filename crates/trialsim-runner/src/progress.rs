//! Progress breakpoints and replicate batches.

use serde::Serialize;

const FRACTION_TOLERANCE: f64 = 1e-9;

/// How new replicates are split into batches between progress reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressPlan {
    /// Cumulative counts of new replicates after each batch. All but the last
    /// are multiples of the worker count; the last equals `n_new`.
    pub breakpoints: Vec<usize>,
    /// Absolute 1-based replicate indices, one vector per breakpoint.
    pub batches: Vec<Vec<usize>>,
    pub start_message: String,
    /// One status line per breakpoint.
    pub messages: Vec<String>,
}

impl ProgressPlan {
    /// Plans `n_new` replicates following `prev` existing ones.
    ///
    /// `progress` must lie in `(0, 1]`, `n_new` and `workers` must be positive;
    /// the orchestrator validates these before planning.
    pub fn new(progress: f64, prev: usize, n_new: usize, workers: usize) -> Self {
        let workers = workers.max(1);

        let mut breakpoints: Vec<usize> = Vec::new();
        for fraction in interior_fractions(progress) {
            let target = fraction * n_new as f64 - FRACTION_TOLERANCE;
            let last = breakpoints.last().copied().unwrap_or(0);
            let rounded = (target / workers as f64).ceil().max(0.0) as usize * workers;
            let candidate = rounded.max(last + workers);
            // Candidates only grow from here on.
            if candidate >= n_new {
                break;
            }
            breakpoints.push(candidate);
        }
        breakpoints.push(n_new);

        let mut batches = Vec::with_capacity(breakpoints.len());
        let mut start = 0;
        for &bp in &breakpoints {
            batches.push(((prev + start + 1)..=(prev + bp)).collect());
            start = bp;
        }

        let messages = breakpoints
            .iter()
            .map(|&bp| format!("{}/{} ({}%)", bp, n_new, format_percent(bp, n_new)))
            .collect();

        Self {
            breakpoints,
            batches,
            start_message: format!("0/{} (0%) [starting]", n_new),
            messages,
        }
    }

    /// A plan with a single batch covering all new replicates.
    pub fn single(prev: usize, n_new: usize) -> Self {
        Self::new(1.0, prev, n_new, 1)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Multiples of `progress` strictly below 1, in increasing order.
fn interior_fractions(progress: f64) -> impl Iterator<Item = f64> {
    (1u64..)
        .map(move |k| k as f64 * progress)
        .take_while(|f| *f < 1.0 - FRACTION_TOLERANCE)
}

fn format_percent(done: usize, total: usize) -> String {
    let pct = (1000.0 * done as f64 / total as f64).round() / 10.0;
    let text = format!("{:.1}", pct);
    text.strip_suffix(".0").map(str::to_string).unwrap_or(text)
}
