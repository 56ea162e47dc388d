//! Dependency DAG bookkeeping for execution plans.

use crate::types::TaskId;
use crate::OrchestrationError;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::{HashMap, HashSet};

/// Tracks predecessors, successors, and the completed set of a validated DAG.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    deps: HashMap<TaskId, HashSet<TaskId>>,
    succ: HashMap<TaskId, HashSet<TaskId>>,
    completed: HashSet<TaskId>,
    topo: Vec<TaskId>,
}

impl DependencyGraph {
    /// Build and validate: every referenced id must exist, and the graph must
    /// be acyclic. The cycle check is iterative and safe for graphs of
    /// 10 000+ nodes.
    pub fn build(
        tasks: &[TaskId],
        dependencies: &HashMap<TaskId, Vec<TaskId>>,
    ) -> Result<Self, OrchestrationError> {
        let known: HashSet<&TaskId> = tasks.iter().collect();
        for (task, deps) in dependencies {
            if !known.contains(task) {
                return Err(OrchestrationError::InvalidSpec(format!(
                    "dependency map references unknown task {}",
                    task
                )));
            }
            for dep in deps {
                if !known.contains(dep) {
                    return Err(OrchestrationError::InvalidSpec(format!(
                        "task {} depends on unknown task {}",
                        task, dep
                    )));
                }
            }
        }

        let mut graph = DiGraph::<TaskId, ()>::new();
        let mut nodes = HashMap::new();
        for task in tasks {
            nodes.insert(task, graph.add_node(task.clone()));
        }
        for (task, deps) in dependencies {
            for dep in deps {
                graph.add_edge(nodes[dep], nodes[task], ());
            }
        }

        let topo = toposort(&graph, None)
            .map_err(|_| OrchestrationError::Cyclic)?
            .into_iter()
            .map(|n| graph[n].clone())
            .collect();

        let mut deps_map: HashMap<TaskId, HashSet<TaskId>> = tasks
            .iter()
            .map(|t| (t.clone(), HashSet::new()))
            .collect();
        let mut succ_map: HashMap<TaskId, HashSet<TaskId>> = tasks
            .iter()
            .map(|t| (t.clone(), HashSet::new()))
            .collect();
        for (task, deps) in dependencies {
            for dep in deps {
                deps_map.get_mut(task).unwrap().insert(dep.clone());
                succ_map.get_mut(dep).unwrap().insert(task.clone());
            }
        }

        Ok(Self {
            deps: deps_map,
            succ: succ_map,
            completed: HashSet::new(),
            topo,
        })
    }

    pub fn is_ready(&self, task: &str) -> bool {
        self.deps
            .get(task)
            .map(|d| d.iter().all(|dep| self.completed.contains(dep)))
            .unwrap_or(false)
    }

    /// Mark a task completed and return successors that just became ready.
    pub fn mark_completed(&mut self, task: &str) -> Vec<TaskId> {
        self.completed.insert(task.to_string());
        self.succ
            .get(task)
            .map(|successors| {
                successors
                    .iter()
                    .filter(|s| self.is_ready(s) && !self.completed.contains(*s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_completed(&self, task: &str) -> bool {
        self.completed.contains(task)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Topological order, kept for diagnostics.
    pub fn topo_order(&self) -> &[TaskId] {
        &self.topo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<TaskId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_linear_chain_readiness() {
        let tasks = ids(&["t1", "t2", "t3"]);
        let deps = HashMap::from([
            ("t2".to_string(), vec!["t1".to_string()]),
            ("t3".to_string(), vec!["t2".to_string()]),
        ]);
        let mut graph = DependencyGraph::build(&tasks, &deps).unwrap();

        assert!(graph.is_ready("t1"));
        assert!(!graph.is_ready("t2"));

        let unlocked = graph.mark_completed("t1");
        assert_eq!(unlocked, vec!["t2".to_string()]);
        assert!(graph.is_ready("t2"));
        assert!(!graph.is_ready("t3"));
    }

    #[test]
    fn test_diamond_waits_for_both_branches() {
        let tasks = ids(&["a", "b", "c", "d"]);
        let deps = HashMap::from([
            ("b".to_string(), vec!["a".to_string()]),
            ("c".to_string(), vec!["a".to_string()]),
            ("d".to_string(), vec!["b".to_string(), "c".to_string()]),
        ]);
        let mut graph = DependencyGraph::build(&tasks, &deps).unwrap();

        graph.mark_completed("a");
        assert!(graph.mark_completed("b").is_empty());
        assert_eq!(graph.mark_completed("c"), vec!["d".to_string()]);
    }

    #[test]
    fn test_cycle_rejected() {
        let tasks = ids(&["t1", "t2"]);
        let deps = HashMap::from([
            ("t1".to_string(), vec!["t2".to_string()]),
            ("t2".to_string(), vec!["t1".to_string()]),
        ]);
        assert!(matches!(
            DependencyGraph::build(&tasks, &deps).unwrap_err(),
            OrchestrationError::Cyclic
        ));
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let tasks = ids(&["t1"]);
        let deps = HashMap::from([("t1".to_string(), vec!["ghost".to_string()])]);
        assert!(matches!(
            DependencyGraph::build(&tasks, &deps).unwrap_err(),
            OrchestrationError::InvalidSpec(_)
        ));
    }

    #[test]
    fn test_large_chain_validates_without_overflow() {
        let n = 10_000;
        let tasks: Vec<TaskId> = (0..n).map(|i| format!("t{}", i)).collect();
        let mut deps = HashMap::new();
        for i in 1..n {
            deps.insert(format!("t{}", i), vec![format!("t{}", i - 1)]);
        }
        let graph = DependencyGraph::build(&tasks, &deps).unwrap();
        assert_eq!(graph.topo_order().len(), n);
        assert_eq!(graph.topo_order()[0], "t0");
    }

    #[test]
    fn test_unknown_task_in_dependency_key_rejected() {
        let tasks = ids(&["t1"]);
        let deps = HashMap::from([("ghost".to_string(), vec!["t1".to_string()])]);
        assert!(DependencyGraph::build(&tasks, &deps).is_err());
    }
}
