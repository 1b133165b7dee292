//! Reference two-arm design with binary outcomes and interim looks.
//!
//! The stopping rule is the design's embedded hook: a one-line expression such
//! as `abs_diff > 0.15` evaluated at every look. It is excluded from the
//! structural view and compared through a digest of its normalized text.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use trialsim_core::source_token;
use trialsim_runner::{Mrg32k3a, ReplicateSimulator, TrialSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TwoArmDesign {
    pub control_rate: f64,
    pub treatment_rate: f64,
    /// Cumulative patient counts at which the stopping rule is evaluated. The
    /// last look is the maximum sample size.
    pub looks: Vec<u32>,
    pub stopping_rule: String,
}

impl Default for TwoArmDesign {
    fn default() -> Self {
        Self {
            control_rate: 0.30,
            treatment_rate: 0.20,
            looks: vec![100, 200, 300, 400],
            stopping_rule: "abs_diff > 0.12".to_string(),
        }
    }
}

impl TrialSpec for TwoArmDesign {
    fn structure(&self) -> Value {
        json!({
            "control_rate": self.control_rate,
            "treatment_rate": self.treatment_rate,
            "looks": self.looks,
        })
    }

    fn hook_tokens(&self) -> BTreeMap<String, String> {
        let mut tokens = BTreeMap::new();
        tokens.insert("stopping_rule".to_string(), source_token(&self.stopping_rule));
        tokens
    }
}

impl TwoArmDesign {
    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("control_rate", self.control_rate),
            ("treatment_rate", self.treatment_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, rate));
            }
        }
        if self.looks.is_empty() {
            return Err(anyhow!("design needs at least one look"));
        }
        if self.looks[0] == 0 || self.looks.windows(2).any(|w| w[0] >= w[1]) {
            return Err(anyhow!(
                "looks must be positive and strictly increasing: {:?}",
                self.looks
            ));
        }
        StoppingRule::parse(&self.stopping_rule)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Metric {
    /// treatment rate minus control rate
    Diff,
    AbsDiff,
    /// treatment rate over control rate
    Ratio,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Comparison {
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoppingRule {
    metric: Metric,
    comparison: Comparison,
    threshold: f64,
}

impl StoppingRule {
    pub fn parse(source: &str) -> Result<Self> {
        let parts: Vec<&str> = source.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(anyhow!(
                "stopping rule must look like '<metric> <op> <threshold>', got '{}'",
                source
            ));
        }
        let metric = match parts[0] {
            "diff" => Metric::Diff,
            "abs_diff" => Metric::AbsDiff,
            "ratio" => Metric::Ratio,
            other => return Err(anyhow!("unknown stopping metric: {}", other)),
        };
        let comparison = match parts[1] {
            ">" => Comparison::Gt,
            ">=" => Comparison::Ge,
            "<" => Comparison::Lt,
            "<=" => Comparison::Le,
            other => return Err(anyhow!("unknown comparison operator: {}", other)),
        };
        let threshold: f64 = parts[2]
            .parse()
            .map_err(|_| anyhow!("stopping threshold is not a number: {}", parts[2]))?;
        Ok(Self {
            metric,
            comparison,
            threshold,
        })
    }

    fn holds(&self, control_rate: f64, treatment_rate: f64) -> bool {
        let value = match self.metric {
            Metric::Diff => treatment_rate - control_rate,
            Metric::AbsDiff => (treatment_rate - control_rate).abs(),
            Metric::Ratio => {
                if control_rate == 0.0 {
                    return false;
                }
                treatment_rate / control_rate
            }
        };
        match self.comparison {
            Comparison::Gt => value > self.threshold,
            Comparison::Ge => value >= self.threshold,
            Comparison::Lt => value < self.threshold,
            Comparison::Le => value <= self.threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookSummary {
    pub patients: u32,
    pub control_n: u32,
    pub control_events: u32,
    pub treatment_n: u32,
    pub treatment_events: u32,
}

impl LookSummary {
    fn rates(&self) -> (f64, f64) {
        (
            rate(self.control_events, self.control_n),
            rate(self.treatment_events, self.treatment_n),
        )
    }
}

fn rate(events: u32, n: u32) -> f64 {
    if n == 0 {
        0.0
    } else {
        f64::from(events) / f64::from(n)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub stopped_early: bool,
    pub final_look: usize,
    pub final_state: LookSummary,
    /// Every look up to the final one; omitted for sparse results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<LookSummary>>,
}

/// Simulates [`TwoArmDesign`] replicates with a pre-parsed stopping rule.
#[derive(Debug, Clone)]
pub struct TwoArmSimulator {
    rule: StoppingRule,
}

impl TwoArmSimulator {
    pub fn for_design(design: &TwoArmDesign) -> Result<Self> {
        design.validate()?;
        Ok(Self {
            rule: StoppingRule::parse(&design.stopping_rule)?,
        })
    }
}

impl ReplicateSimulator<TwoArmDesign> for TwoArmSimulator {
    type Output = TrialOutcome;

    fn simulate(
        &self,
        spec: &TwoArmDesign,
        sparse: bool,
        rng: &mut Mrg32k3a,
    ) -> Result<TrialOutcome> {
        let mut state = LookSummary {
            patients: 0,
            control_n: 0,
            control_events: 0,
            treatment_n: 0,
            treatment_events: 0,
        };
        let last = spec
            .looks
            .len()
            .checked_sub(1)
            .ok_or_else(|| anyhow!("design needs at least one look"))?;
        let mut history = Vec::with_capacity(spec.looks.len());

        for (look, &target) in spec.looks.iter().enumerate() {
            while state.patients < target {
                let treated = rng.next_uniform() < 0.5;
                let p = if treated {
                    spec.treatment_rate
                } else {
                    spec.control_rate
                };
                let event = rng.next_uniform() < p;
                if treated {
                    state.treatment_n += 1;
                    state.treatment_events += u32::from(event);
                } else {
                    state.control_n += 1;
                    state.control_events += u32::from(event);
                }
                state.patients += 1;
            }
            history.push(state.clone());

            let (control, treatment) = state.rates();
            if look < last && self.rule.holds(control, treatment) {
                return Ok(finish(state, look, true, history, sparse));
            }
        }
        Ok(finish(state, last, false, history, sparse))
    }
}

fn finish(
    state: LookSummary,
    look: usize,
    stopped_early: bool,
    history: Vec<LookSummary>,
    sparse: bool,
) -> TrialOutcome {
    TrialOutcome {
        stopped_early,
        final_look: look + 1,
        final_state: state,
        history: if sparse { None } else { Some(history) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trialsim_runner::SeedState;

    #[test]
    fn stopping_rule_parses_supported_forms() {
        let rule = StoppingRule::parse("abs_diff > 0.1").expect("abs_diff");
        assert!(rule.holds(0.3, 0.15));
        assert!(!rule.holds(0.3, 0.25));
        assert!(StoppingRule::parse("ratio <= 0.5").expect("ratio").holds(0.4, 0.2));
        assert!(!StoppingRule::parse("ratio < 1").expect("ratio").holds(0.0, 0.2));
        assert!(StoppingRule::parse("diff >").is_err());
        assert!(StoppingRule::parse("odds > 1").is_err());
        assert!(StoppingRule::parse("diff => 1").is_err());
        assert!(StoppingRule::parse("diff > x").is_err());
    }

    #[test]
    fn design_validation() {
        assert!(TwoArmDesign::default().validate().is_ok());
        let bad_looks = TwoArmDesign {
            looks: vec![100, 100],
            ..TwoArmDesign::default()
        };
        assert!(bad_looks.validate().is_err());
        let bad_rate = TwoArmDesign {
            control_rate: 1.5,
            ..TwoArmDesign::default()
        };
        assert!(bad_rate.validate().is_err());
    }

    #[test]
    fn hook_is_excluded_from_structure() {
        let a = TwoArmDesign::default();
        let b = TwoArmDesign {
            stopping_rule: "abs_diff > 0.5".to_string(),
            ..TwoArmDesign::default()
        };
        assert_eq!(a.structure_digest(), b.structure_digest());
        assert_ne!(a.hook_tokens(), b.hook_tokens());
    }

    #[test]
    fn sparse_drops_history_only() {
        let design = TwoArmDesign::default();
        let sim = TwoArmSimulator::for_design(&design).expect("simulator");
        let state = SeedState::from_seed(31);
        let full = sim
            .simulate(&design, false, &mut Mrg32k3a::from_state(state))
            .expect("full");
        let sparse = sim
            .simulate(&design, true, &mut Mrg32k3a::from_state(state))
            .expect("sparse");
        assert_eq!(full.final_state, sparse.final_state);
        assert_eq!(full.final_look, sparse.final_look);
        assert!(sparse.history.is_none());
        let history = full.history.expect("history");
        assert_eq!(history.len(), full.final_look);
        assert_eq!(history.last(), Some(&full.final_state));
    }

    #[test]
    fn design_without_looks_is_an_error() {
        let sim = TwoArmSimulator::for_design(&TwoArmDesign::default()).expect("simulator");
        let empty = TwoArmDesign {
            looks: Vec::new(),
            ..TwoArmDesign::default()
        };
        let err = sim
            .simulate(&empty, true, &mut Mrg32k3a::from_state(SeedState::from_seed(9)))
            .expect_err("no looks");
        assert!(err.to_string().contains("at least one look"));
    }

    #[test]
    fn never_stopping_rule_runs_to_max_sample_size() {
        let design = TwoArmDesign {
            stopping_rule: "abs_diff > 2".to_string(),
            ..TwoArmDesign::default()
        };
        let sim = TwoArmSimulator::for_design(&design).expect("simulator");
        let outcome = sim
            .simulate(&design, true, &mut Mrg32k3a::from_state(SeedState::from_seed(4)))
            .expect("outcome");
        assert!(!outcome.stopped_early);
        assert_eq!(outcome.final_look, 4);
        assert_eq!(outcome.final_state.patients, 400);
        assert_eq!(
            outcome.final_state.control_n + outcome.final_state.treatment_n,
            400
        );
    }
}
