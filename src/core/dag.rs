//! Task graph for dependency management.
//!
//! `TaskGraph` holds the session's tasks as nodes of a petgraph `DiGraph`
//! with an edge from each dependency to its dependent. Cycles are rejected
//! when the edge is added, so the graph is a DAG at every point.

use crate::core::plan::Plan;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::state::event::Event;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, HashSet};

/// The task dependency graph.
pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a graph from a validated plan, resolving dependencies by name.
    pub fn from_plan(plan: &Plan) -> Result<Self> {
        plan.validate()?;
        let mut graph = Self::new();
        let mut by_name = HashMap::new();
        for spec in &plan.tasks {
            let task = spec.to_task();
            by_name.insert(spec.name.clone(), task.id);
            graph.add_task(task);
        }
        for spec in &plan.tasks {
            let to = by_name[&spec.name];
            for dep in &spec.dependencies {
                let from = by_name
                    .get(dep)
                    .ok_or_else(|| Error::TaskNotFound(dep.clone()))?;
                graph.add_dependency(from, &to)?;
            }
        }
        Ok(graph)
    }

    /// Rebuild a graph from replayed tasks and dependency edges.
    pub fn from_parts<'a>(
        tasks: impl IntoIterator<Item = &'a Task>,
        dependencies: impl IntoIterator<Item = &'a (TaskId, TaskId)>,
    ) -> Result<Self> {
        let mut graph = Self::new();
        for task in tasks {
            let mut task = task.clone();
            // Edges are re-added below and restore this set.
            task.dependencies.clear();
            graph.add_task(task);
        }
        for (from, to) in dependencies {
            graph.add_dependency(from, to)?;
        }
        Ok(graph)
    }

    /// Add a task to the graph.
    ///
    /// If a task with the same id already exists, returns the existing index.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Add a dependency: `from` must pass before `to` can start.
    ///
    /// # Errors
    /// - `TaskNotFound` if either task is missing
    /// - `CycleDetected` if `to` already reaches `from`
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = *self
            .task_index
            .get(from)
            .ok_or_else(|| Error::TaskNotFound(from.to_string()))?;
        let to_index = *self
            .task_index
            .get(to)
            .ok_or_else(|| Error::TaskNotFound(to.to_string()))?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        if from_index == to_index || has_path_connecting(&self.graph, to_index, from_index, None)
        {
            let task = self.graph[to_index].name.clone();
            return Err(Error::CycleDetected { task });
        }

        self.graph.add_edge(from_index, to_index, ());
        self.graph[to_index].dependencies.insert(*from);
        Ok(())
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Look up a task, failing with `TaskNotFound`.
    pub fn task(&self, id: &TaskId) -> Result<&Task> {
        self.get_task(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Task> {
        self.graph.node_weights().find(|t| t.name == name)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&f), Some(&t)) => self.graph.find_edge(f, t).is_some(),
            _ => false,
        }
    }

    /// All dependency edges as (dependency, dependent) pairs.
    pub fn dependencies(&self) -> BTreeSet<(TaskId, TaskId)> {
        self.graph
            .edge_indices()
            .filter_map(|edge| self.graph.edge_endpoints(edge))
            .map(|(from, to)| (self.graph[from].id, self.graph[to].id))
            .collect()
    }

    /// Tasks the given task depends on.
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend on the given task.
    pub fn get_dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// All tasks, sorted by name.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.graph.node_weights().collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Fold a logged event into the task it concerns.
    pub fn apply(&mut self, event: &Event) {
        if let Some(id) = event.task_id {
            if let Some(&index) = self.task_index.get(&id) {
                self.graph[index].apply(event);
            }
        }
    }

    // ========== Scheduling Operations ==========

    /// Pending tasks whose dependencies are all in `integrated`.
    pub fn ready_tasks(&self, integrated: &HashSet<TaskId>) -> Vec<&Task> {
        self.all_tasks()
            .into_iter()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| self.unmet_dependencies(&task.id, integrated).is_empty())
            .collect()
    }

    /// Dependencies of `id` not yet in `integrated`, sorted by name.
    pub fn unmet_dependencies(&self, id: &TaskId, integrated: &HashSet<TaskId>) -> Vec<TaskId> {
        let mut unmet: Vec<&Task> = self
            .get_dependencies(id)
            .into_iter()
            .filter(|dep| !integrated.contains(&dep.id))
            .collect();
        unmet.sort_by(|a, b| a.name.cmp(&b.name));
        unmet.into_iter().map(|t| t.id).collect()
    }

    /// Whether every task has reached Passed.
    pub fn all_passed(&self) -> bool {
        self.graph
            .node_weights()
            .all(|t| t.status == TaskStatus::Passed)
    }

    /// Layer the graph into batches.
    ///
    /// Batch N holds every task whose dependencies all sit in earlier
    /// batches. Tasks within a batch are sorted by name, so the result is
    /// deterministic for a given graph.
    pub fn topological_batches(&self) -> Result<Vec<Vec<TaskId>>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();

        let mut current: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();

        let mut batches = Vec::new();
        let mut placed = 0;
        while !current.is_empty() {
            current.sort_by(|a, b| {
                self.graph[*a]
                    .name
                    .cmp(&self.graph[*b].name)
                    .then(self.graph[*a].id.cmp(&self.graph[*b].id))
            });
            placed += current.len();

            let mut next = Vec::new();
            for &node in &current {
                for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
                    if let Some(degree) = in_degree.get_mut(&dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }

            batches.push(current.iter().map(|&n| self.graph[n].id).collect());
            current = next;
        }

        if placed < self.graph.node_count() {
            let task = in_degree
                .iter()
                .filter(|&(_, &d)| d > 0)
                .map(|(&n, _)| self.graph[n].name.clone())
                .min()
                .unwrap_or_default();
            return Err(Error::CycleDetected { task });
        }

        Ok(batches)
    }

    /// Tasks in a dependency-respecting order (batches flattened).
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        Ok(self
            .topological_batches()?
            .into_iter()
            .flatten()
            .filter_map(|id| self.get_task(&id))
            .collect())
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
