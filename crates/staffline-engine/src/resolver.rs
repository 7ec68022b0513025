//! Dependency resolution for workflow steps.
//!
//! Eligibility is a pure function of a step snapshot. Definition checks
//! (templates and freeform step lists) reject unknown prerequisites and
//! cycles before anything is written.

use std::collections::{HashMap, HashSet, VecDeque};

use regex::Regex;

use staffline_core::error::{Result, StafflineError};
use staffline_core::types::{StepBlueprint, StepId, StepKind, StepStatus, WorkflowStep};

const BLUEPRINT_ID_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,63}$";

/// Whether a step may enter `in_progress` or `completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// Some prerequisites exist but are not `completed`.
    Blocked { unmet: Vec<StepId> },
    /// Some prerequisites name steps that are not in the instance.
    Misconfigured {
        unmet: Vec<StepId>,
        missing: Vec<StepId>,
    },
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible)
    }

    /// Precondition error for a step that is not eligible.
    pub fn into_error(self, step: &StepId) -> Option<StafflineError> {
        match self {
            Self::Eligible => None,
            Self::Blocked { unmet } => Some(StafflineError::DependencyNotMet {
                step: step.clone(),
                unmet,
                missing: vec![],
            }),
            Self::Misconfigured { unmet, missing } => Some(StafflineError::DependencyNotMet {
                step: step.clone(),
                unmet,
                missing,
            }),
        }
    }
}

/// Check `step` against the other steps of its instance.
pub fn check(step: &WorkflowStep, all_steps: &[WorkflowStep]) -> Eligibility {
    if step.prerequisites.is_empty() {
        return Eligibility::Eligible;
    }

    let by_id: HashMap<&StepId, StepStatus> =
        all_steps.iter().map(|s| (&s.id, s.status)).collect();

    let mut unmet = Vec::new();
    let mut missing = Vec::new();
    for prereq in &step.prerequisites {
        match by_id.get(prereq) {
            Some(StepStatus::Completed) => {}
            Some(_) => unmet.push(prereq.clone()),
            None => missing.push(prereq.clone()),
        }
    }

    if !missing.is_empty() {
        Eligibility::Misconfigured { unmet, missing }
    } else if !unmet.is_empty() {
        Eligibility::Blocked { unmet }
    } else {
        Eligibility::Eligible
    }
}

pub fn is_eligible(step: &WorkflowStep, all_steps: &[WorkflowStep]) -> bool {
    check(step, all_steps).is_eligible()
}

/// Validate a list of step blueprints as a dependency graph.
///
/// Ids must be well-formed and unique, prerequisites must name sibling
/// blueprints other than the step itself, integration steps must declare a
/// provider kind, and the graph must be acyclic.
pub fn validate_blueprints(steps: &[StepBlueprint]) -> Result<()> {
    if steps.is_empty() {
        return Err(StafflineError::InvalidDefinition(
            "workflow has no steps".into(),
        ));
    }

    let id_re = Regex::new(BLUEPRINT_ID_PATTERN)
        .map_err(|e| StafflineError::InvalidDefinition(e.to_string()))?;

    let mut ids = HashSet::new();
    for bp in steps {
        if !id_re.is_match(&bp.id) {
            return Err(StafflineError::InvalidDefinition(format!(
                "invalid step id '{}'",
                bp.id
            )));
        }
        if bp.title.trim().is_empty() {
            return Err(StafflineError::InvalidDefinition(format!(
                "step '{}' has an empty title",
                bp.id
            )));
        }
        if !ids.insert(bp.id.as_str()) {
            return Err(StafflineError::InvalidDefinition(format!(
                "duplicate step id '{}'",
                bp.id
            )));
        }
        match (bp.kind, bp.integration) {
            (StepKind::Integration, None) => {
                return Err(StafflineError::InvalidDefinition(format!(
                    "integration step '{}' has no integration kind",
                    bp.id
                )))
            }
            (kind, Some(_)) if kind != StepKind::Integration => {
                return Err(StafflineError::InvalidDefinition(format!(
                    "step '{}' names an integration but is of kind {}",
                    bp.id, kind
                )))
            }
            _ => {}
        }
    }

    for bp in steps {
        let mut seen = HashSet::new();
        for prereq in &bp.prerequisites {
            if prereq == &bp.id {
                return Err(StafflineError::InvalidDefinition(format!(
                    "step '{}' lists itself as a prerequisite",
                    bp.id
                )));
            }
            if !ids.contains(prereq.as_str()) {
                return Err(StafflineError::InvalidDefinition(format!(
                    "step '{}' has unknown prerequisite '{}'",
                    bp.id, prereq
                )));
            }
            if !seen.insert(prereq.as_str()) {
                return Err(StafflineError::InvalidDefinition(format!(
                    "step '{}' lists prerequisite '{}' twice",
                    bp.id, prereq
                )));
            }
        }
    }

    if let Some(stuck) = find_cycle(steps) {
        return Err(StafflineError::InvalidDefinition(format!(
            "dependency cycle through step '{}'",
            stuck
        )));
    }
    Ok(())
}

/// Kahn's algorithm; returns a step left over when the graph has a cycle.
fn find_cycle(steps: &[StepBlueprint]) -> Option<String> {
    let mut indegree: HashMap<&str, usize> = steps
        .iter()
        .map(|bp| (bp.id.as_str(), bp.prerequisites.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for bp in steps {
        for prereq in &bp.prerequisites {
            dependents
                .entry(prereq.as_str())
                .or_default()
                .push(bp.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for dep in dependents.get(id).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(dep) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(*dep);
                }
            }
        }
    }

    if visited == steps.len() {
        return None;
    }
    steps
        .iter()
        .find(|bp| indegree.get(bp.id.as_str()).copied().unwrap_or(0) > 0)
        .map(|bp| bp.id.clone())
}
