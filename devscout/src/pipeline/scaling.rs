//! Queue-depth driven autoscaling.
//!
//! The ideal worker count for a stage is a sub-linear function of the depth
//! of its input queue: a few workers for a trickle of items, a few dozen for
//! tens of thousands. Each [`ScalingTerm`] contributes
//! `round(log_base(depth + offset * base) ^ exp)`; the ideal is the largest
//! term, and never zero while work is waiting.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One `round(log_base(depth + offset * base) ^ exp)` term.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingTerm {
    pub base_log: f64,
    pub exp: f64,
}

impl ScalingTerm {
    pub const fn new(base_log: f64, exp: f64) -> Self {
        Self { base_log, exp }
    }

    fn eval(&self, depth: usize, offset: f64) -> f64 {
        let x = depth as f64 + offset * self.base_log;
        (x.ln() / self.base_log.ln()).powf(self.exp).round()
    }
}

/// Scaling formula shared by every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingFormula {
    /// Multiplied by each term's base and added to the depth, so that the
    /// logarithm stays positive at depth 0.
    pub offset: f64,
    pub terms: Vec<ScalingTerm>,
}

impl Default for ScalingFormula {
    fn default() -> Self {
        Self {
            offset: 0.509,
            terms: vec![ScalingTerm::new(100.0, 4.5), ScalingTerm::new(10.0, 2.3)],
        }
    }
}

impl ScalingFormula {
    pub fn validate(&self) -> Result<()> {
        if self.terms.is_empty() {
            return Err(Error::validation("scaling formula needs at least one term"));
        }
        if !(self.offset.is_finite() && self.offset > 0.0) {
            return Err(Error::validation("scaling offset must be a positive number"));
        }
        for term in &self.terms {
            if !(term.base_log.is_finite() && term.base_log > 1.0) {
                return Err(Error::validation(format!(
                    "scaling base must be greater than 1 (got {})",
                    term.base_log
                )));
            }
            if !(term.exp.is_finite() && term.exp > 0.0) {
                return Err(Error::validation(format!(
                    "scaling exponent must be positive (got {})",
                    term.exp
                )));
            }
            // A log below zero would turn fractional powers into NaN.
            if self.offset * term.base_log < 1.0 {
                return Err(Error::validation(
                    "offset * base must be at least 1 for every term",
                ));
            }
        }
        Ok(())
    }

    /// Uncapped ideal worker count for a queue holding `depth` items.
    pub fn ideal(&self, depth: usize) -> usize {
        let best = self
            .terms
            .iter()
            .map(|t| t.eval(depth, self.offset))
            .filter(|v| v.is_finite())
            .fold(0.0_f64, f64::max);

        let ideal = best.max(0.0) as usize;
        if depth > 0 { ideal.max(1) } else { ideal }
    }
}

/// Ideal worker count for one stage.
///
/// `max_workers` caps the formula but never pushes a non-empty queue down to
/// zero workers.
pub fn ideal_workers(depth: usize, formula: &ScalingFormula, max_workers: Option<usize>) -> usize {
    let ideal = formula.ideal(depth);
    match max_workers {
        Some(cap) if depth > 0 => ideal.min(cap.max(1)),
        Some(cap) => ideal.min(cap),
        None => ideal,
    }
}
