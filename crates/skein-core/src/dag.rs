// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task-relation graph of a workflow definition.
//!
//! [`Dag::build`] validates the definition (duplicate codes, dangling edges,
//! cycles, unknown start nodes) and computes the executable set: every node
//! when no start-node restriction is given, otherwise the start nodes and
//! their descendants. Predecessors outside the executable set count as
//! satisfied.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::{CoreError, Result};
use crate::model::{FailureStrategy, TaskExecutionStatus, WorkflowDefinition};

/// Validated DAG with an executable-set restriction applied.
#[derive(Debug, Clone)]
pub struct Dag {
    topo_order: Vec<i64>,
    predecessors: HashMap<i64, Vec<i64>>,
    successors: HashMap<i64, Vec<i64>>,
    executable: BTreeSet<i64>,
}

impl Dag {
    /// Validate `definition` and restrict it to `start_nodes` (empty means all).
    pub fn build(definition: &WorkflowDefinition, start_nodes: &[i64]) -> Result<Self> {
        let mut codes = HashSet::with_capacity(definition.tasks.len());
        for task in &definition.tasks {
            if !codes.insert(task.code) {
                return Err(CoreError::invalid_dag(format!(
                    "duplicate task code {}",
                    task.code
                )));
            }
        }

        let mut predecessors: HashMap<i64, Vec<i64>> =
            codes.iter().map(|c| (*c, Vec::new())).collect();
        let mut successors: HashMap<i64, Vec<i64>> =
            codes.iter().map(|c| (*c, Vec::new())).collect();
        let mut seen_edges = HashSet::new();

        for relation in &definition.relations {
            for end in [relation.pre, relation.post] {
                if !codes.contains(&end) {
                    return Err(CoreError::invalid_dag(format!(
                        "relation {} -> {} references unknown task {}",
                        relation.pre, relation.post, end
                    )));
                }
            }
            if relation.pre == relation.post {
                return Err(CoreError::invalid_dag(format!(
                    "task {} depends on itself",
                    relation.pre
                )));
            }
            if !seen_edges.insert((relation.pre, relation.post)) {
                continue;
            }
            successors
                .entry(relation.pre)
                .or_default()
                .push(relation.post);
            predecessors
                .entry(relation.post)
                .or_default()
                .push(relation.pre);
        }

        let topo_order = kahn_order(definition, &predecessors, &successors)?;

        let executable = if start_nodes.is_empty() {
            codes.iter().copied().collect()
        } else {
            for code in start_nodes {
                if !codes.contains(code) {
                    return Err(CoreError::invalid_dag(format!(
                        "start node {} is not a task of definition {}",
                        code, definition.code
                    )));
                }
            }
            descendants_of(start_nodes, &successors)
        };

        Ok(Self {
            topo_order,
            predecessors,
            successors,
            executable,
        })
    }

    /// Whether `code` takes part in this run.
    pub fn is_executable(&self, code: i64) -> bool {
        self.executable.contains(&code)
    }

    /// Executable codes in topological order.
    pub fn executable_nodes(&self) -> impl Iterator<Item = i64> + '_ {
        self.topo_order
            .iter()
            .copied()
            .filter(|c| self.executable.contains(c))
    }

    pub fn predecessors(&self, code: i64) -> &[i64] {
        self.predecessors.get(&code).map_or(&[], Vec::as_slice)
    }

    pub fn successors(&self, code: i64) -> &[i64] {
        self.successors.get(&code).map_or(&[], Vec::as_slice)
    }

    /// Whether every executable predecessor of `code` finished well enough.
    ///
    /// `state_of` returns the state of the ACTIVE attempt for a task code.
    pub fn predecessors_satisfied<F>(&self, code: i64, strategy: FailureStrategy, state_of: F) -> bool
    where
        F: Fn(i64) -> Option<TaskExecutionStatus>,
    {
        self.predecessors(code)
            .iter()
            .filter(|p| self.executable.contains(p))
            .all(|p| match (state_of(*p), strategy) {
                (Some(TaskExecutionStatus::Success), _) => true,
                (Some(TaskExecutionStatus::Failure), FailureStrategy::Continue) => true,
                _ => false,
            })
    }

    /// Executable tasks with no attempt yet whose predecessors are satisfied.
    ///
    /// Ordered by priority (highest first), then by task code.
    pub fn ready_tasks<F>(
        &self,
        definition: &WorkflowDefinition,
        strategy: FailureStrategy,
        state_of: F,
    ) -> Vec<i64>
    where
        F: Fn(i64) -> Option<TaskExecutionStatus>,
    {
        let mut ready: Vec<i64> = self
            .executable_nodes()
            .filter(|code| state_of(*code).is_none())
            .filter(|code| self.predecessors_satisfied(*code, strategy, &state_of))
            .collect();
        ready.sort_by_key(|code| {
            let priority = definition.task(*code).map(|t| t.priority).unwrap_or_default();
            (priority, *code)
        });
        ready
    }
}

fn kahn_order(
    definition: &WorkflowDefinition,
    predecessors: &HashMap<i64, Vec<i64>>,
    successors: &HashMap<i64, Vec<i64>>,
) -> Result<Vec<i64>> {
    let mut in_degree: HashMap<i64, usize> = predecessors
        .iter()
        .map(|(code, preds)| (*code, preds.len()))
        .collect();

    // Seed in declaration order so the result is deterministic.
    let mut queue: VecDeque<i64> = definition
        .tasks
        .iter()
        .map(|t| t.code)
        .filter(|c| in_degree.get(c) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(in_degree.len());

    while let Some(code) = queue.pop_front() {
        order.push(code);
        for next in successors.get(&code).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if order.len() != in_degree.len() {
        let mut stuck: Vec<i64> = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(c, _)| c)
            .collect();
        stuck.sort_unstable();
        return Err(CoreError::invalid_dag(format!(
            "cycle detected among tasks {:?}",
            stuck
        )));
    }
    Ok(order)
}

fn descendants_of(roots: &[i64], successors: &HashMap<i64, Vec<i64>>) -> BTreeSet<i64> {
    let mut visited = BTreeSet::new();
    let mut stack: Vec<i64> = roots.to_vec();
    while let Some(code) = stack.pop() {
        if visited.insert(code) {
            stack.extend(successors.get(&code).into_iter().flatten().copied());
        }
    }
    visited
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, TaskDefinition};

    fn diamond() -> WorkflowDefinition {
        // 1 -> 2, 1 -> 3, 2 -> 4, 3 -> 4
        WorkflowDefinition::new(1, 1, "diamond")
            .with_task(TaskDefinition::new(1, "a", "SHELL"))
            .with_task(TaskDefinition::new(2, "b", "SHELL"))
            .with_task(TaskDefinition::new(3, "c", "SHELL"))
            .with_task(TaskDefinition::new(4, "d", "SHELL"))
            .with_relation(1, 2)
            .with_relation(1, 3)
            .with_relation(2, 4)
            .with_relation(3, 4)
    }

    fn states(pairs: &[(i64, TaskExecutionStatus)]) -> HashMap<i64, TaskExecutionStatus> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_topological_order() {
        let dag = Dag::build(&diamond(), &[]).unwrap();
        let order: Vec<i64> = dag.executable_nodes().collect();
        assert_eq!(order.first(), Some(&1));
        assert_eq!(order.last(), Some(&4));
        assert_eq!(dag.predecessors(4), &[2, 3]);
        assert_eq!(dag.successors(1), &[2, 3]);
    }

    #[test]
    fn test_cycle_rejected() {
        let def = diamond().with_relation(4, 1);
        let err = Dag::build(&def, &[]).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_DAG");
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_self_loop_rejected() {
        let def = diamond().with_relation(2, 2);
        assert!(Dag::build(&def, &[]).is_err());
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let def = diamond().with_relation(4, 99);
        let err = Dag::build(&def, &[]).unwrap_err();
        assert!(err.to_string().contains("unknown task 99"));
    }

    #[test]
    fn test_duplicate_code_rejected() {
        let def = diamond().with_task(TaskDefinition::new(2, "dup", "SHELL"));
        let err = Dag::build(&def, &[]).unwrap_err();
        assert!(err.to_string().contains("duplicate task code 2"));
    }

    #[test]
    fn test_unknown_start_node_rejected() {
        assert!(Dag::build(&diamond(), &[42]).is_err());
    }

    #[test]
    fn test_initial_ready_set() {
        let dag = Dag::build(&diamond(), &[]).unwrap();
        let ready = dag.ready_tasks(&diamond(), FailureStrategy::Continue, |_| None);
        assert_eq!(ready, vec![1]);
    }

    #[test]
    fn test_join_waits_for_all_predecessors() {
        let def = diamond();
        let dag = Dag::build(&def, &[]).unwrap();
        let current = states(&[
            (1, TaskExecutionStatus::Success),
            (2, TaskExecutionStatus::Success),
            (3, TaskExecutionStatus::RunningExecution),
        ]);
        assert!(
            dag.ready_tasks(&def, FailureStrategy::End, |c| current.get(&c).copied())
                .is_empty()
        );

        let current = states(&[
            (1, TaskExecutionStatus::Success),
            (2, TaskExecutionStatus::Success),
            (3, TaskExecutionStatus::Success),
        ]);
        assert_eq!(
            dag.ready_tasks(&def, FailureStrategy::End, |c| current.get(&c).copied()),
            vec![4]
        );
    }

    #[test]
    fn test_continue_runs_after_failed_predecessor() {
        let def = diamond();
        let dag = Dag::build(&def, &[]).unwrap();
        let current = states(&[
            (1, TaskExecutionStatus::Success),
            (2, TaskExecutionStatus::Failure),
            (3, TaskExecutionStatus::Success),
        ]);
        let lookup = |c: i64| current.get(&c).copied();
        assert_eq!(dag.ready_tasks(&def, FailureStrategy::Continue, lookup), vec![4]);
        assert!(dag.ready_tasks(&def, FailureStrategy::End, lookup).is_empty());
    }

    #[test]
    fn test_paused_predecessor_blocks() {
        let def = diamond();
        let dag = Dag::build(&def, &[]).unwrap();
        let current = states(&[(1, TaskExecutionStatus::Pause)]);
        assert!(
            dag.ready_tasks(&def, FailureStrategy::Continue, |c| current.get(&c).copied())
                .is_empty()
        );
    }

    #[test]
    fn test_start_node_restriction() {
        let def = diamond();
        let dag = Dag::build(&def, &[2]).unwrap();
        assert!(!dag.is_executable(1));
        assert!(dag.is_executable(2));
        assert!(!dag.is_executable(3));
        assert!(dag.is_executable(4));

        // Ancestors outside the set count as satisfied.
        let ready = dag.ready_tasks(&def, FailureStrategy::End, |_| None);
        assert_eq!(ready, vec![2]);

        let current = states(&[(2, TaskExecutionStatus::Success)]);
        assert_eq!(
            dag.ready_tasks(&def, FailureStrategy::End, |c| current.get(&c).copied()),
            vec![4]
        );
    }

    #[test]
    fn test_ready_ordered_by_priority() {
        let def = WorkflowDefinition::new(1, 1, "fan")
            .with_task(TaskDefinition::new(1, "low", "SHELL").with_priority(Priority::Low))
            .with_task(TaskDefinition::new(2, "high", "SHELL").with_priority(Priority::Highest))
            .with_task(TaskDefinition::new(3, "mid", "SHELL"));
        let dag = Dag::build(&def, &[]).unwrap();
        assert_eq!(
            dag.ready_tasks(&def, FailureStrategy::Continue, |_| None),
            vec![2, 3, 1]
        );
    }

    #[test]
    fn test_duplicate_relations_collapse() {
        let def = diamond().with_relation(1, 2);
        let dag = Dag::build(&def, &[]).unwrap();
        assert_eq!(dag.successors(1), &[2, 3]);
    }
}
