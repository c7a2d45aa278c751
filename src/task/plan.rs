//! Plans: the subtask list a decomposer hands to the scheduler.
//!
//! # Acceptance rules
//! - Non-empty, at most `max_steps` steps
//! - Step indices are unique
//! - Cost tiers are 1..=5
//! - Every action derives its capability requirements
//! - Dependencies name existing steps, never the step itself
//! - The dependency graph is acyclic
//! - Dependencies reference earlier steps
//!
//! A plan that breaks any rule is rejected whole; nothing is scheduled.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::action::{Action, ActionError};
use super::task::TaskContract;
use super::verification::AcceptanceCriterion;
use crate::capability::{Capability, CapabilitySet};

fn default_cost_tier() -> u8 {
    1
}

/// One step as proposed by the decomposer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Unique within the plan
    pub step: u32,

    #[serde(default)]
    pub description: String,

    pub action: Action,

    /// Capability tag the arm must declare on top of what the action needs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_capability: Option<Capability>,

    #[serde(default)]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,

    /// Earlier steps that must complete first
    #[serde(default)]
    pub depends_on: Vec<u32>,

    /// Relative expense, 1 (cheap) to 5
    #[serde(default = "default_cost_tier")]
    pub cost_tier: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<u64>,
}

impl PlanStep {
    pub fn new(step: u32, action: Action) -> Self {
        Self {
            step,
            description: String::new(),
            action,
            required_capability: None,
            acceptance_criteria: Vec::new(),
            depends_on: Vec::new(),
            cost_tier: default_cost_tier(),
            estimated_duration_secs: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.required_capability = Some(capability);
        self
    }

    pub fn with_criteria(mut self, criteria: Vec<AcceptanceCriterion>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    pub fn depends_on(mut self, steps: impl IntoIterator<Item = u32>) -> Self {
        self.depends_on.extend(steps);
        self
    }

    pub fn with_cost_tier(mut self, tier: u8) -> Self {
        self.cost_tier = tier;
        self
    }

    /// The action's requirements plus the capability tag.
    pub fn required_capabilities(&self) -> Result<CapabilitySet, ActionError> {
        let mut caps = self.action.required_capabilities()?;
        if let Some(tag) = &self.required_capability {
            caps.insert(tag.clone());
        }
        Ok(caps)
    }
}

/// A decomposition of a task into steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self {
            steps,
            rationale: None,
            confidence: None,
        }
    }

    /// Check every acceptance rule.
    ///
    /// # Errors
    /// The first rule broken, checked in the order listed in the module docs
    /// except that cycles are reported before forward references.
    pub fn validate(&self, max_steps: usize) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::Empty);
        }
        if self.steps.len() > max_steps {
            return Err(PlanError::TooManySteps {
                count: self.steps.len(),
                max: max_steps,
            });
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.step) {
                return Err(PlanError::DuplicateStep(step.step));
            }
            if !(1..=5).contains(&step.cost_tier) {
                return Err(PlanError::InvalidCostTier {
                    step: step.step,
                    tier: step.cost_tier,
                });
            }
            step.required_capabilities()
                .map_err(|e| PlanError::InvalidAction {
                    step: step.step,
                    reason: e.to_string(),
                })?;
        }

        for step in &self.steps {
            for &dep in &step.depends_on {
                if dep == step.step {
                    return Err(PlanError::SelfDependency(step.step));
                }
                if !seen.contains(&dep) {
                    return Err(PlanError::UnknownDependency {
                        step: step.step,
                        dependency: dep,
                    });
                }
            }
        }

        self.execution_order()?;

        for step in &self.steps {
            if let Some(&dep) = step.depends_on.iter().find(|&&dep| dep > step.step) {
                return Err(PlanError::ForwardDependency {
                    step: step.step,
                    dependency: dep,
                });
            }
        }
        Ok(())
    }

    /// Topological order of step indices (Kahn's algorithm).
    ///
    /// # Errors
    /// `PlanError::CircularDependency` naming every step left with a
    /// non-zero in-degree.
    pub fn execution_order(&self) -> Result<Vec<u32>, PlanError> {
        let index: HashMap<u32, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step, i))
            .collect();
        let n = self.steps.len();
        let mut in_degree = vec![0usize; n];
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                if let Some(&d) = index.get(dep) {
                    adj[d].push(i);
                    in_degree[i] += 1;
                }
            }
        }

        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(n);

        while let Some(node) = queue.pop_front() {
            order.push(self.steps[node].step);
            for &next in &adj[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != n {
            let mut steps: Vec<u32> = in_degree
                .iter()
                .enumerate()
                .filter(|(_, &d)| d > 0)
                .map(|(i, _)| self.steps[i].step)
                .collect();
            steps.sort_unstable();
            Err(PlanError::CircularDependency { steps })
        } else {
            Ok(order)
        }
    }
}

/// Errors in plan shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("Plan has no steps")]
    Empty,

    #[error("Plan has {count} steps, more than the maximum of {max}")]
    TooManySteps { count: usize, max: usize },

    #[error("Step index {0} appears more than once")]
    DuplicateStep(u32),

    #[error("Step {step} has cost tier {tier}, expected 1-5")]
    InvalidCostTier { step: u32, tier: u8 },

    #[error("Step {step} has an invalid action: {reason}")]
    InvalidAction { step: u32, reason: String },

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: u32, dependency: u32 },

    #[error("Step {0} depends on itself")]
    SelfDependency(u32),

    #[error("Circular dependency among steps {steps:?}")]
    CircularDependency { steps: Vec<u32> },

    #[error("Step {step} depends on later step {dependency}")]
    ForwardDependency { step: u32, dependency: u32 },
}

/// External collaborator that turns a goal into a plan.
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(&self, contract: &TaskContract) -> anyhow::Result<Plan>;
}
