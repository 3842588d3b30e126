//! Module dependency graph validation and self-healing.
//!
//! The graph is derived per call from a [`Workflow`] snapshot: modules live in
//! an arena indexed by sorted module id, and edges run dependency -> dependent.
//! Every operation here returns a new workflow value and leaves its input
//! untouched so callers can diff before/after.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::core::types::{GraphPolicy, MissingDependencyPolicy};
use crate::error::GraphError;
use crate::workflow::{Module, Workflow};

/// Upper bound on edge removals performed by [`attempt_autocorrect_cycle`].
pub const MAX_CYCLE_REPAIRS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(GraphError),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn into_result(self) -> Result<(), GraphError> {
        match self {
            ValidationResult::Valid => Ok(()),
            ValidationResult::Invalid(err) => Err(err),
        }
    }
}

/// Arena view over one workflow's modules.
#[derive(Debug)]
pub struct DependencyGraph<'a> {
    ids: Vec<&'a str>,
    dependents: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl<'a> DependencyGraph<'a> {
    /// Index modules and resolve dependency ids.
    ///
    /// Fails on duplicate module ids or dependencies that name no module.
    pub fn build(workflow: &'a Workflow) -> Result<Self, GraphError> {
        let mut index: BTreeMap<&'a str, usize> = BTreeMap::new();
        for module in &workflow.modules {
            if index.insert(module.module_id.as_str(), 0).is_some() {
                return Err(GraphError::DuplicateModule(module.module_id.clone()));
            }
        }
        let ids: Vec<&'a str> = index.keys().copied().collect();
        for (pos, id) in ids.iter().enumerate() {
            index.insert(*id, pos);
        }

        let mut dependents = vec![Vec::new(); ids.len()];
        for module in sorted_modules(workflow) {
            let to = index[module.module_id.as_str()];
            for dependency in &module.dependencies {
                let from = *index.get(dependency.as_str()).ok_or_else(|| {
                    GraphError::MissingDependency {
                        module: module.module_id.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                dependents[from].push(to);
            }
        }
        for edges in &mut dependents {
            edges.sort_unstable();
        }

        Ok(Self { ids, dependents })
    }

    /// First cycle found by depth-first traversal in id order.
    ///
    /// The returned sequence starts and ends on the same module, following
    /// dependency -> dependent edges (`["a", "b", "a"]`: b depends on a, a on b).
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.ids.len()];
        for start in 0..self.ids.len() {
            if marks[start] == Mark::Unvisited {
                if let Some(cycle) = self.visit(start, &mut marks) {
                    return Some(cycle.into_iter().map(|i| self.ids[i].to_string()).collect());
                }
            }
        }
        None
    }

    /// Iterative depth-first walk from `root` over `(node, next edge index)`
    /// frames; depth is not limited by the thread stack.
    fn visit(&self, root: usize, marks: &mut [Mark]) -> Option<Vec<usize>> {
        let mut frames: Vec<(usize, usize)> = vec![(root, 0)];
        marks[root] = Mark::InProgress;
        while let Some(frame) = frames.last_mut() {
            let (node, edge) = *frame;
            let Some(&next) = self.dependents[node].get(edge) else {
                marks[node] = Mark::Done;
                frames.pop();
                continue;
            };
            frame.1 += 1;
            match marks[next] {
                Mark::InProgress => {
                    let pos = frames.iter().position(|&(n, _)| n == next).unwrap_or(0);
                    let mut cycle: Vec<usize> = frames[pos..].iter().map(|&(n, _)| n).collect();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    marks[next] = Mark::InProgress;
                    frames.push((next, 0));
                }
                Mark::Done => {}
            }
        }
        None
    }

    /// Kahn's algorithm with lexicographic tie-break; `None` if cyclic.
    pub fn topological_order(&self) -> Option<Vec<String>> {
        let mut indegree = vec![0usize; self.ids.len()];
        for edges in &self.dependents {
            for &to in edges {
                indegree[to] += 1;
            }
        }
        let mut ready: BTreeSet<usize> = (0..self.ids.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.ids.len());
        while let Some(node) = ready.pop_first() {
            order.push(self.ids[node].to_string());
            for &to in &self.dependents[node] {
                indegree[to] -= 1;
                if indegree[to] == 0 {
                    ready.insert(to);
                }
            }
        }
        (order.len() == self.ids.len()).then_some(order)
    }
}

/// Check every graph invariant, reporting the first violation.
///
/// Order: duplicate module ids, dangling dependency ids, unknown phases,
/// unproduced input tags, contested output tags, cycles.
pub fn validate(workflow: &Workflow) -> ValidationResult {
    match check(workflow) {
        Ok(()) => ValidationResult::Valid,
        Err(err) => {
            debug!(workflow_id = %workflow.workflow_id, version = %workflow.version, error = %err, "workflow graph invalid");
            ValidationResult::Invalid(err)
        }
    }
}

fn check(workflow: &Workflow) -> Result<(), GraphError> {
    let phases: BTreeSet<&str> = workflow.phases.iter().map(|p| p.id.as_str()).collect();
    let graph = DependencyGraph::build(workflow)?;

    for module in sorted_modules(workflow) {
        if !phases.contains(module.phase_id.as_str()) {
            return Err(GraphError::UnknownPhase {
                module: module.module_id.clone(),
                phase: module.phase_id.clone(),
            });
        }
    }

    let producers = output_producers(workflow);
    for module in sorted_modules(workflow) {
        if let Some(tag) = module.inputs.iter().find(|tag| !producers.contains_key(*tag)) {
            return Err(GraphError::MissingProducer {
                module: module.module_id.clone(),
                tag: tag.clone(),
            });
        }
    }
    if let Some((tag, modules)) = producers.into_iter().find(|(_, modules)| modules.len() > 1) {
        return Err(GraphError::DuplicateOutput { tag, modules });
    }

    match graph.find_cycle() {
        Some(nodes) => Err(GraphError::Cycle { nodes }),
        None => Ok(()),
    }
}

/// Resolve dangling dependency ids and unproduced input tags per `policy`.
///
/// Idempotent: a workflow with nothing missing comes back unchanged.
pub fn autocorrect_missing_dependencies(
    workflow: &Workflow,
    policy: MissingDependencyPolicy,
) -> Workflow {
    let mut next = workflow.clone();
    let mut order: Vec<String> = next.modules.iter().map(|m| m.module_id.clone()).collect();
    order.sort();

    for module_id in &order {
        let known: BTreeSet<String> = next.modules.iter().map(|m| m.module_id.clone()).collect();
        let Some(module) = next.module(module_id) else {
            continue;
        };
        let phase_id = module.phase_id.clone();
        let dangling: Vec<String> = module
            .dependencies
            .iter()
            .filter(|dep| !known.contains(*dep))
            .cloned()
            .collect();

        for dependency in dangling {
            match policy {
                MissingDependencyPolicy::Synthesize => {
                    info!(module = %module_id, dependency = %dependency, "synthesized placeholder for missing dependency");
                    next.push_module(synthetic_module(&dependency, &phase_id, None));
                }
                MissingDependencyPolicy::Prune => {
                    info!(module = %module_id, dependency = %dependency, "pruned missing dependency");
                    if let Some(module) = next.module_mut(module_id) {
                        module.dependencies.remove(&dependency);
                    }
                }
            }
        }
    }

    for module_id in &order {
        let producers = output_producers(&next);
        let Some(module) = next.module(module_id) else {
            continue;
        };
        let phase_id = module.phase_id.clone();
        let unproduced: Vec<String> = module
            .inputs
            .iter()
            .filter(|tag| !producers.contains_key(*tag))
            .cloned()
            .collect();

        for tag in unproduced {
            match policy {
                MissingDependencyPolicy::Synthesize => {
                    let producer_id = unique_synthetic_id(&next, &tag);
                    info!(module = %module_id, tag = %tag, producer = %producer_id, "synthesized producer for unproduced input");
                    next.push_module(synthetic_module(&producer_id, &phase_id, Some(&tag)));
                    if let Some(module) = next.module_mut(module_id) {
                        module.dependencies.insert(producer_id);
                    }
                }
                MissingDependencyPolicy::Prune => {
                    info!(module = %module_id, tag = %tag, "pruned unproduced input");
                    if let Some(module) = next.module_mut(module_id) {
                        module.inputs.remove(&tag);
                    }
                }
            }
        }
    }

    next
}

/// Give each contested output tag to its lexicographically smallest claimant.
pub fn autocorrect_duplicate_outputs(workflow: &Workflow) -> Workflow {
    let mut next = workflow.clone();
    for (tag, modules) in output_producers(workflow) {
        for loser in modules.iter().skip(1) {
            info!(tag = %tag, kept_by = %modules[0], dropped_from = %loser, "deduplicated output tag");
            if let Some(module) = next.module_mut(loser) {
                module.outputs.remove(&tag);
            }
        }
    }
    next
}

/// Break dependency cycles by removing the lowest-priority edge on each.
///
/// Priority is the lexicographically smallest `(dependency, dependent)` pair
/// on the detected cycle. At most [`MAX_CYCLE_REPAIRS`] edges are removed;
/// if a cycle remains after that, returns [`GraphError::CycleUnresolved`].
pub fn attempt_autocorrect_cycle(workflow: &Workflow) -> Result<Workflow, GraphError> {
    let mut current = workflow.clone();
    let mut removed: Vec<(String, String)> = Vec::new();
    loop {
        let cycle = match DependencyGraph::build(&current)?.find_cycle() {
            Some(cycle) => cycle,
            None => return Ok(current),
        };
        if removed.len() >= MAX_CYCLE_REPAIRS {
            return Err(GraphError::CycleUnresolved { cycle, removed });
        }

        let Some((dependency, dependent)) = lowest_priority_edge(&cycle) else {
            return Err(GraphError::CycleUnresolved { cycle, removed });
        };
        info!(
            workflow_id = %current.workflow_id,
            dependency = %dependency,
            dependent = %dependent,
            cycle = %cycle.join(" -> "),
            "removed cycle edge"
        );
        if let Some(module) = current.module_mut(&dependent) {
            module.dependencies.remove(&dependency);
        }
        removed.push((dependency, dependent));
    }
}

/// Run the self-healing pipeline and return a valid workflow or the
/// violation that policy could not repair.
pub fn repair(workflow: &Workflow, policy: &GraphPolicy) -> Result<Workflow, GraphError> {
    if validate(workflow).is_valid() {
        return Ok(workflow.clone());
    }
    let mut current = autocorrect_missing_dependencies(workflow, policy.missing_dependency_policy);
    if policy.dedupe_outputs {
        current = autocorrect_duplicate_outputs(&current);
    }
    let current = attempt_autocorrect_cycle(&current)?;
    validate(&current).into_result()?;
    Ok(current)
}

/// Deterministic execution order of a valid workflow's modules.
pub fn execution_order(workflow: &Workflow) -> Result<Vec<String>, GraphError> {
    validate(workflow).into_result()?;
    let graph = DependencyGraph::build(workflow)?;
    graph
        .topological_order()
        .ok_or_else(|| GraphError::Cycle { nodes: Vec::new() })
}

fn lowest_priority_edge(cycle: &[String]) -> Option<(String, String)> {
    cycle
        .windows(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .min()
}

fn sorted_modules(workflow: &Workflow) -> Vec<&Module> {
    let mut modules: Vec<&Module> = workflow.modules.iter().collect();
    modules.sort_by(|a, b| a.module_id.cmp(&b.module_id));
    modules
}

/// Output tag -> sorted ids of modules producing it.
fn output_producers(workflow: &Workflow) -> BTreeMap<String, Vec<String>> {
    let mut producers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for module in sorted_modules(workflow) {
        for tag in &module.outputs {
            producers
                .entry(tag.clone())
                .or_default()
                .push(module.module_id.clone());
        }
    }
    producers
}

fn unique_synthetic_id(workflow: &Workflow, tag: &str) -> String {
    let base = format!("synthetic-{tag}");
    let mut candidate = base.clone();
    let mut n = 2;
    while workflow.module(&candidate).is_some() {
        candidate = format!("{base}-{n}");
        n += 1;
    }
    candidate
}

fn synthetic_module(module_id: &str, phase_id: &str, output: Option<&str>) -> Module {
    Module {
        module_id: module_id.to_string(),
        phase_id: phase_id.to_string(),
        name: format!("Placeholder for {module_id}"),
        inputs: BTreeSet::new(),
        outputs: output.map(str::to_string).into_iter().collect(),
        dependencies: BTreeSet::new(),
        ai_logic: String::new(),
        human_actionable: String::new(),
        synthetic: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvalidReason;
    use crate::test_support::{linear_workflow, module, module_io, workflow_with_modules};

    #[test]
    fn acyclic_workflow_is_valid() {
        assert_eq!(validate(&linear_workflow()), ValidationResult::Valid);
    }

    #[test]
    fn reports_missing_dependency() {
        let wf = workflow_with_modules("wf", vec![module("a", "p1", &["ghost"])]);
        assert_eq!(
            validate(&wf),
            ValidationResult::Invalid(GraphError::MissingDependency {
                module: "a".to_string(),
                dependency: "ghost".to_string(),
            })
        );
    }

    #[test]
    fn reports_unproduced_input_as_missing_dependency() {
        let wf = workflow_with_modules("wf", vec![module_io("a", "p1", &["brief"], &[], &[])]);
        let ValidationResult::Invalid(err) = validate(&wf) else {
            panic!("expected invalid");
        };
        assert_eq!(err.reason(), InvalidReason::MissingDependency);
    }

    #[test]
    fn reports_duplicate_output_with_claimants() {
        let wf = workflow_with_modules(
            "wf",
            vec![
                module_io("b", "p1", &[], &["report"], &[]),
                module_io("a", "p1", &[], &["report"], &[]),
            ],
        );
        assert_eq!(
            validate(&wf),
            ValidationResult::Invalid(GraphError::DuplicateOutput {
                tag: "report".to_string(),
                modules: vec!["a".to_string(), "b".to_string()],
            })
        );
    }

    #[test]
    fn reports_unknown_phase_and_duplicate_module() {
        let mut wf = linear_workflow();
        wf.modules[0].phase_id = "nowhere".to_string();
        let ValidationResult::Invalid(err) = validate(&wf) else {
            panic!("expected invalid");
        };
        assert_eq!(err.reason(), InvalidReason::UnknownPhase);

        let mut wf = linear_workflow();
        let dup = wf.modules[0].clone();
        wf.modules.push(dup);
        let ValidationResult::Invalid(err) = validate(&wf) else {
            panic!("expected invalid");
        };
        assert_eq!(err.reason(), InvalidReason::DuplicateModule);
    }

    #[test]
    fn cycle_detail_lists_participating_modules() {
        let wf = workflow_with_modules(
            "wf",
            vec![
                module("a", "p1", &["c"]),
                module("b", "p1", &["a"]),
                module("c", "p1", &["b"]),
                module("d", "p1", &[]),
            ],
        );
        assert_eq!(
            validate(&wf),
            ValidationResult::Invalid(GraphError::Cycle {
                nodes: vec![
                    "a".to_string(),
                    "b".to_string(),
                    "c".to_string(),
                    "a".to_string()
                ],
            })
        );
    }

    fn long_chain(len: usize) -> Vec<Module> {
        (0..len)
            .map(|i| {
                let id = format!("m{i:05}");
                match i.checked_sub(1) {
                    Some(prev) => module(&id, "p1", &[format!("m{prev:05}").as_str()]),
                    None => module(&id, "p1", &[]),
                }
            })
            .collect()
    }

    /// Runs `f` on a thread with the default 2 MiB stack.
    fn on_small_stack<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(f)
            .expect("spawn")
            .join()
            .expect("join")
    }

    #[test]
    fn long_dependency_chain_validates_without_deep_recursion() {
        let wf = workflow_with_modules("wf", long_chain(20_000));
        let result = on_small_stack(move || validate(&wf));
        assert_eq!(result, ValidationResult::Valid);
    }

    #[test]
    fn long_cycle_is_reported_in_full() {
        let mut modules = long_chain(20_000);
        modules[0].dependencies.insert("m19999".to_string());
        let wf = workflow_with_modules("wf", modules);

        let result = on_small_stack(move || validate(&wf));
        let ValidationResult::Invalid(GraphError::Cycle { nodes }) = result else {
            panic!("expected cycle, got {result:?}");
        };
        assert_eq!(nodes.len(), 20_001);
        assert_eq!(nodes.first().map(String::as_str), Some("m00000"));
        assert_eq!(nodes.last().map(String::as_str), Some("m00000"));
    }

    #[test]
    fn synthesize_policy_adds_placeholders_and_is_idempotent() {
        let wf = workflow_with_modules(
            "wf",
            vec![
                module_io("a", "p1", &["brief"], &["plan"], &["ghost"]),
                module_io("b", "p1", &["plan", "brief"], &[], &["a"]),
            ],
        );
        let fixed = autocorrect_missing_dependencies(&wf, MissingDependencyPolicy::Synthesize);
        assert!(validate(&fixed).is_valid());

        let ghost = fixed.module("ghost").expect("ghost placeholder");
        assert!(ghost.synthetic);
        let producer = fixed.module("synthetic-brief").expect("brief producer");
        assert!(producer.synthetic);
        assert!(producer.outputs.contains("brief"));
        assert!(fixed.module("a").expect("a").dependencies.contains("synthetic-brief"));
        assert!(
            fixed
                .phase("p1")
                .expect("phase")
                .tasks
                .contains(&"synthetic-brief".to_string())
        );

        let again = autocorrect_missing_dependencies(&fixed, MissingDependencyPolicy::Synthesize);
        assert_eq!(again, fixed);
    }

    #[test]
    fn prune_policy_removes_dangling_references() {
        let wf = workflow_with_modules(
            "wf",
            vec![module_io("a", "p1", &["brief"], &[], &["ghost"])],
        );
        let fixed = autocorrect_missing_dependencies(&wf, MissingDependencyPolicy::Prune);
        let a = fixed.module("a").expect("a");
        assert!(a.inputs.is_empty());
        assert!(a.dependencies.is_empty());
        assert_eq!(fixed.modules.len(), 1);
        assert_eq!(
            autocorrect_missing_dependencies(&fixed, MissingDependencyPolicy::Prune),
            fixed
        );
    }

    #[test]
    fn duplicate_outputs_go_to_smallest_module_id() {
        let wf = workflow_with_modules(
            "wf",
            vec![
                module_io("b", "p1", &[], &["report"], &[]),
                module_io("a", "p1", &[], &["report"], &[]),
            ],
        );
        let fixed = autocorrect_duplicate_outputs(&wf);
        assert!(fixed.module("a").expect("a").outputs.contains("report"));
        assert!(fixed.module("b").expect("b").outputs.is_empty());
        assert!(validate(&fixed).is_valid());
    }

    #[test]
    fn cycle_repair_removes_smallest_edge() {
        let wf = workflow_with_modules(
            "wf",
            vec![
                module("a", "p1", &["c"]),
                module("b", "p1", &["a"]),
                module("c", "p1", &["b"]),
            ],
        );
        let fixed = attempt_autocorrect_cycle(&wf).expect("repairable");
        assert!(validate(&fixed).is_valid());
        // Edges on the cycle: (a,b) (b,c) (c,a); (a,b) is smallest.
        assert!(fixed.module("b").expect("b").dependencies.is_empty());
        assert!(fixed.module("a").expect("a").dependencies.contains("c"));
        assert!(wf.module("b").expect("b").dependencies.contains("a"));
    }

    #[test]
    fn cycle_repair_gives_up_after_bound() {
        let ids = ["a", "b", "c", "d", "e"];
        let modules = ids
            .iter()
            .map(|id| {
                let deps: Vec<&str> = ids.iter().copied().filter(|other| other != id).collect();
                module(id, "p1", &deps)
            })
            .collect();
        let wf = workflow_with_modules("wf", modules);

        let err = attempt_autocorrect_cycle(&wf).expect_err("too dense to repair");
        let GraphError::CycleUnresolved { removed, cycle } = err else {
            panic!("expected CycleUnresolved");
        };
        assert_eq!(removed.len(), MAX_CYCLE_REPAIRS);
        assert!(cycle.len() >= 3);
    }

    #[test]
    fn repair_pipeline_fixes_all_recoverable_violations() {
        let wf = workflow_with_modules(
            "wf",
            vec![
                module_io("a", "p1", &[], &["plan"], &["b"]),
                module_io("b", "p1", &["brief"], &["plan"], &["a"]),
            ],
        );
        let fixed = repair(&wf, &GraphPolicy::default()).expect("repaired");
        assert!(validate(&fixed).is_valid());

        let strict = GraphPolicy {
            dedupe_outputs: false,
            ..GraphPolicy::default()
        };
        let err = repair(&wf, &strict).expect_err("duplicate output is not repaired");
        assert_eq!(err.reason(), InvalidReason::DuplicateOutput);
    }

    #[test]
    fn execution_order_is_topological_with_id_tie_break() {
        let wf = workflow_with_modules(
            "wf",
            vec![
                module("z", "p1", &[]),
                module("m", "p1", &["z"]),
                module("a", "p1", &[]),
            ],
        );
        assert_eq!(execution_order(&wf).expect("order"), vec!["a", "z", "m"]);
    }
}
