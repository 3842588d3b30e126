use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::scores::ScoreVector;

/// One versioned snapshot of a workflow lineage.
///
/// `workflow_id` is shared by every version in a lineage; only `version`
/// changes as refinement cycles commit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub workflow_id: String,
    pub version: String,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub modules: Vec<Module>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<ScoreVector>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Phase {
    pub id: String,
    pub title: String,
    /// Module ids in execution order.
    #[serde(default)]
    pub tasks: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Module {
    pub module_id: String,
    pub phase_id: String,
    pub name: String,
    #[serde(default)]
    pub inputs: BTreeSet<String>,
    #[serde(default)]
    pub outputs: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub ai_logic: String,
    #[serde(default)]
    pub human_actionable: String,
    /// Placeholder created by graph autocorrection rather than authored.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
}

impl Workflow {
    pub fn module(&self, module_id: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.module_id == module_id)
    }

    pub fn module_mut(&mut self, module_id: &str) -> Option<&mut Module> {
        self.modules.iter_mut().find(|m| m.module_id == module_id)
    }

    pub fn phase(&self, phase_id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    pub fn phase_mut(&mut self, phase_id: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.id == phase_id)
    }

    /// Append `module` and register it at the end of its phase's task list.
    pub fn push_module(&mut self, module: Module) {
        if let Some(phase) = self.phase_mut(&module.phase_id) {
            if !phase.tasks.contains(&module.module_id) {
                phase.tasks.push(module.module_id.clone());
            }
        }
        self.modules.push(module);
    }
}

/// Next version string in a lineage.
///
/// Increments the last dotted segment when it is numeric (`1.2` -> `1.3`),
/// otherwise appends `.1` (`draft` -> `draft.1`). A tail at `u64::MAX`
/// also takes the `.1` suffix.
pub fn next_version(version: &str) -> String {
    let bump = |segment: &str| segment.parse::<u64>().ok().and_then(|n| n.checked_add(1));
    match version.rsplit_once('.') {
        Some((head, last)) => match bump(last) {
            Some(n) => format!("{head}.{n}"),
            None => format!("{version}.1"),
        },
        None => match bump(version) {
            Some(n) => n.to_string(),
            None if version.is_empty() => "1".to_string(),
            None => format!("{version}.1"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_version_increments_numeric_tail() {
        assert_eq!(next_version("1.0.0"), "1.0.1");
        assert_eq!(next_version("1.9"), "1.10");
        assert_eq!(next_version("7"), "8");
    }

    #[test]
    fn next_version_appends_when_tail_is_not_numeric() {
        assert_eq!(next_version("draft"), "draft.1");
        assert_eq!(next_version("1.0-rc"), "1.0-rc.1");
        assert_eq!(next_version(""), "1");
    }

    #[test]
    fn next_version_never_overflows_the_tail() {
        assert_eq!(
            next_version("1.18446744073709551615"),
            "1.18446744073709551615.1"
        );
        assert_eq!(next_version("18446744073709551615"), "18446744073709551615.1");
    }

    #[test]
    fn module_fields_default_when_absent() {
        let raw = r#"{
            "workflow_id": "wf",
            "version": "1",
            "phases": [{"id": "p1", "title": "Plan"}],
            "modules": [{"module_id": "m1", "phase_id": "p1", "name": "Draft"}]
        }"#;
        let workflow: Workflow = serde_json::from_str(raw).expect("parse");
        let module = workflow.module("m1").expect("module");
        assert!(module.inputs.is_empty());
        assert!(!module.synthetic);
        assert!(workflow.metadata.is_empty());
        assert!(workflow.phase("p1").expect("phase").tasks.is_empty());
    }
}
