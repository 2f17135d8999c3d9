//! Dependency graph construction and validation.
//!
//! Builds the task DAG from a validated [`Plan`], rejecting duplicate
//! ids, unknown dependencies, oversized dependency lists, and cycles
//! (detected with Kahn's algorithm, reporting the tasks stuck in the
//! cycle). Assigns each task an execution layer:
//! `layer(t) = 1 + max(layer(dep))`, with dependency-free tasks at layer
//! zero. Layers and the critical path are deterministic so that two runs
//! of the same plan produce comparable traces.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use archon_postbox::AgentId;

use super::Plan;

/// Maximum number of dependencies a single task may declare.
pub const MAX_DEPENDENCIES: usize = 20;

/// Errors from DAG construction.
#[derive(Debug, Error)]
pub enum DagError {
    #[error("duplicate task_id: {0:?}")]
    DuplicateTaskId(String),

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle detected involving tasks: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("task {task:?} has {count} dependencies (max {MAX_DEPENDENCIES})")]
    DependencyCountExceeded { task: String, count: usize },
}

/// The validated dependency graph of a plan, with layers assigned.
#[derive(Debug, Clone)]
pub struct Dag {
    /// Task indices per execution layer; each layer sorted by task_id.
    layers: Vec<Vec<usize>>,
    /// Layer of each task, indexed by task index.
    layer_of: Vec<usize>,
    /// Direct dependents (reverse edges), indexed by task index.
    dependents: Vec<Vec<usize>>,
    /// Longest root-to-leaf path, lexicographically smallest among ties.
    critical_path: Vec<String>,
    /// Width of the widest layer.
    parallelizable_tasks: usize,
    /// Distinct agents referenced by the plan, in stable order.
    agents_involved: Vec<AgentId>,
    /// task_id -> task index.
    index: HashMap<String, usize>,
}

impl Dag {
    /// Construct and validate the DAG for `plan`.
    pub fn build(plan: &Plan) -> Result<Self, DagError> {
        let n = plan.tasks.len();

        // Index task ids, rejecting duplicates.
        let mut index = HashMap::with_capacity(n);
        for (i, task) in plan.tasks.iter().enumerate() {
            if index.insert(task.task_id.clone(), i).is_some() {
                return Err(DagError::DuplicateTaskId(task.task_id.clone()));
            }
        }

        // Resolve dependency edges.
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];
        for (i, task) in plan.tasks.iter().enumerate() {
            if task.dependencies.len() > MAX_DEPENDENCIES {
                return Err(DagError::DependencyCountExceeded {
                    task: task.task_id.clone(),
                    count: task.dependencies.len(),
                });
            }
            for dep_name in &task.dependencies {
                let &dep = index.get(dep_name.as_str()).ok_or_else(|| {
                    DagError::UnknownDependency {
                        task: task.task_id.clone(),
                        dependency: dep_name.clone(),
                    }
                })?;
                deps[i].push(dep);
                dependents[dep].push(i);
                in_degree[i] += 1;
            }
        }

        // Kahn's algorithm: peel zero-in-degree tasks, assigning
        // layer(t) = 1 + max(layer(dep)).
        let mut layer_of = vec![0usize; n];
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut remaining = in_degree.clone();
        let mut visited = 0usize;

        while let Some(node) = queue.pop_front() {
            visited += 1;
            for &dependent in &dependents[node] {
                layer_of[dependent] = layer_of[dependent].max(layer_of[node] + 1);
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if visited != n {
            let mut cycle: Vec<String> = remaining
                .iter()
                .enumerate()
                .filter(|(_, deg)| **deg > 0)
                .map(|(i, _)| plan.tasks[i].task_id.clone())
                .collect();
            cycle.sort();
            return Err(DagError::CyclicDependency(cycle));
        }

        // Group into layers, ordered by task_id within each layer for
        // deterministic dispatch order.
        let depth = layer_of.iter().copied().max().map(|m| m + 1).unwrap_or(0);
        let mut layers: Vec<Vec<usize>> = vec![Vec::new(); depth];
        for (i, &layer) in layer_of.iter().enumerate() {
            layers[layer].push(i);
        }
        for layer in &mut layers {
            layer.sort_by(|&a, &b| plan.tasks[a].task_id.cmp(&plan.tasks[b].task_id));
        }

        let parallelizable_tasks = layers.iter().map(Vec::len).max().unwrap_or(0);

        let critical_path = critical_path(plan, &deps, &layer_of, depth);

        let mut agents_involved: Vec<AgentId> = Vec::new();
        for agent in AgentId::ALL {
            if plan.tasks.iter().any(|t| t.agent == agent) {
                agents_involved.push(agent);
            }
        }

        Ok(Self {
            layers,
            layer_of,
            dependents,
            critical_path,
            parallelizable_tasks,
            agents_involved,
            index,
        })
    }

    /// Number of layers (the DAG's depth).
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[Vec<usize>] {
        &self.layers
    }

    pub fn layer_of(&self, task_index: usize) -> usize {
        self.layer_of[task_index]
    }

    pub fn index_of(&self, task_id: &str) -> Option<usize> {
        self.index.get(task_id).copied()
    }

    pub fn critical_path(&self) -> &[String] {
        &self.critical_path
    }

    pub fn parallelizable_tasks(&self) -> usize {
        self.parallelizable_tasks
    }

    pub fn agents_involved(&self) -> &[AgentId] {
        &self.agents_involved
    }

    /// Direct dependents of a task.
    pub fn dependents_of(&self, task_index: usize) -> &[usize] {
        &self.dependents[task_index]
    }

    /// All transitive dependents of a task.
    pub fn descendants_of(&self, task_index: usize) -> Vec<usize> {
        let mut seen = vec![false; self.layer_of.len()];
        let mut stack: Vec<usize> = self.dependents[task_index].to_vec();
        let mut out = Vec::new();
        while let Some(node) = stack.pop() {
            if seen[node] {
                continue;
            }
            seen[node] = true;
            out.push(node);
            stack.extend_from_slice(&self.dependents[node]);
        }
        out.sort();
        out
    }
}

/// Longest root-to-leaf path; among equally long paths, the one whose
/// task-id sequence is lexicographically smallest.
///
/// Every deepest-layer task terminates a longest path, and a longest path
/// only steps through dependencies exactly one layer up, so the best path
/// to each task extends the best path of its deepest dependency.
fn critical_path(
    plan: &Plan,
    deps: &[Vec<usize>],
    layer_of: &[usize],
    depth: usize,
) -> Vec<String> {
    if depth == 0 {
        return Vec::new();
    }

    let n = plan.tasks.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| layer_of[i]);

    let mut best: Vec<Vec<&str>> = vec![Vec::new(); n];
    for &i in &order {
        let layer = layer_of[i];
        if layer == 0 {
            best[i] = vec![plan.tasks[i].task_id.as_str()];
            continue;
        }
        let prefix = deps[i]
            .iter()
            .filter(|&&d| layer_of[d] == layer - 1)
            .map(|&d| &best[d])
            .min()
            .expect("a task above layer 0 has a dependency one layer up");
        let mut path = prefix.clone();
        path.push(plan.tasks[i].task_id.as_str());
        best[i] = path;
    }

    let winner = (0..n)
        .filter(|&i| layer_of[i] == depth - 1)
        .map(|i| &best[i])
        .min()
        .expect("at least one task sits on the deepest layer");
    winner.iter().map(|s| (*s).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;

    fn plan_with(tasks: &[(&str, &[&str])]) -> Plan {
        let mut yaml = String::from("plan_id: p\nversion: 1.0.0\ntasks:\n");
        for (id, deps) in tasks {
            yaml.push_str(&format!(
                "  - task_id: {id}\n    agent: CA\n    task_type: custom\n"
            ));
            if !deps.is_empty() {
                let list = deps.join(", ");
                yaml.push_str(&format!("    dependencies: [{list}]\n"));
            }
        }
        Plan::from_str(&yaml).expect("plan should parse")
    }

    #[test]
    fn linear_chain_layers() {
        let plan = plan_with(&[("A", &[]), ("B", &["A"]), ("C", &["B"])]);
        let dag = Dag::build(&plan).unwrap();
        assert_eq!(dag.depth(), 3);
        assert_eq!(dag.layer_of(dag.index_of("A").unwrap()), 0);
        assert_eq!(dag.layer_of(dag.index_of("B").unwrap()), 1);
        assert_eq!(dag.layer_of(dag.index_of("C").unwrap()), 2);
        assert_eq!(dag.critical_path(), &["A", "B", "C"]);
        assert_eq!(dag.parallelizable_tasks(), 1);
    }

    #[test]
    fn diamond_layers_and_width() {
        let plan = plan_with(&[
            ("ROOT", &[]),
            ("LEFT", &["ROOT"]),
            ("RIGHT", &["ROOT"]),
            ("JOIN", &["LEFT", "RIGHT"]),
        ]);
        let dag = Dag::build(&plan).unwrap();
        assert_eq!(dag.depth(), 3);
        assert_eq!(dag.parallelizable_tasks(), 2);
        // Ties broken lexicographically: LEFT < RIGHT.
        assert_eq!(dag.critical_path(), &["ROOT", "LEFT", "JOIN"]);
    }

    #[test]
    fn layer_order_is_sorted_by_task_id() {
        let plan = plan_with(&[("ZETA", &[]), ("ALPHA", &[]), ("MID", &[])]);
        let dag = Dag::build(&plan).unwrap();
        let ids: Vec<&str> = dag.layers()[0]
            .iter()
            .map(|&i| plan.tasks[i].task_id.as_str())
            .collect();
        assert_eq!(ids, vec!["ALPHA", "MID", "ZETA"]);
    }

    #[test]
    fn duplicate_task_id_rejected() {
        // Duplicates can't be expressed through plan_with (the plan
        // loader accepts them; uniqueness is a DAG-level check).
        let mut plan = plan_with(&[("A", &[]), ("B", &[])]);
        plan.tasks[1].task_id = "A".to_owned();
        let err = Dag::build(&plan).unwrap_err();
        assert!(matches!(err, DagError::DuplicateTaskId(ref id) if id == "A"));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let plan = plan_with(&[("A", &["GHOST"])]);
        let err = Dag::build(&plan).unwrap_err();
        assert!(matches!(
            err,
            DagError::UnknownDependency { ref dependency, .. } if dependency == "GHOST"
        ));
    }

    #[test]
    fn direct_cycle_rejected_with_members() {
        let plan = plan_with(&[("A", &["B"]), ("B", &["A"])]);
        let err = Dag::build(&plan).unwrap_err();
        match err {
            DagError::CyclicDependency(members) => {
                assert_eq!(members, vec!["A".to_owned(), "B".to_owned()]);
            }
            other => panic!("expected CyclicDependency, got {other}"),
        }
    }

    #[test]
    fn transitive_cycle_rejected() {
        let plan = plan_with(&[("A", &["C"]), ("B", &["A"]), ("C", &["B"])]);
        assert!(matches!(
            Dag::build(&plan),
            Err(DagError::CyclicDependency(_))
        ));
    }

    #[test]
    fn cycle_report_excludes_tasks_outside_the_cycle() {
        let plan = plan_with(&[("OK", &[]), ("A", &["B"]), ("B", &["A"])]);
        match Dag::build(&plan).unwrap_err() {
            DagError::CyclicDependency(members) => {
                assert!(!members.contains(&"OK".to_owned()));
            }
            other => panic!("expected CyclicDependency, got {other}"),
        }
    }

    #[test]
    fn dependency_count_limit() {
        let dep_names: Vec<String> = (0..21).map(|i| format!("D{i}")).collect();
        let mut tasks: Vec<(&str, &[&str])> = Vec::new();
        let dep_refs: Vec<&str> = dep_names.iter().map(String::as_str).collect();
        for name in &dep_refs {
            tasks.push((*name, &[]));
        }
        tasks.push(("FAN_IN", &dep_refs));
        let plan = plan_with(&tasks);
        let err = Dag::build(&plan).unwrap_err();
        assert!(matches!(
            err,
            DagError::DependencyCountExceeded { count: 21, .. }
        ));
    }

    #[test]
    fn critical_path_prefers_lexicographically_smallest() {
        // Two equally long chains: A1->B1 and A0->B9. Path comparison is
        // element-wise, so A0... wins at the first hop.
        let plan = plan_with(&[("A1", &[]), ("B1", &["A1"]), ("A0", &[]), ("B9", &["A0"])]);
        let dag = Dag::build(&plan).unwrap();
        assert_eq!(dag.critical_path(), &["A0", "B9"]);
    }

    #[test]
    fn descendants_are_transitive() {
        let plan = plan_with(&[("A", &[]), ("B", &["A"]), ("C", &["B"]), ("X", &[])]);
        let dag = Dag::build(&plan).unwrap();
        let a = dag.index_of("A").unwrap();
        let descendants: Vec<&str> = dag
            .descendants_of(a)
            .into_iter()
            .map(|i| plan.tasks[i].task_id.as_str())
            .collect();
        assert_eq!(descendants, vec!["B", "C"]);
    }

    #[test]
    fn agents_involved_is_deduplicated() {
        let plan = plan_with(&[("A", &[]), ("B", &[])]);
        let dag = Dag::build(&plan).unwrap();
        assert_eq!(dag.agents_involved(), &[AgentId::Ca]);
    }
}
