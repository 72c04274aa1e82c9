//! Sprint scheduling and track assignment.
//!
//! The scheduler lays the task graph out as topological batches, packs the
//! batches into sprints bounded by an effort budget, and splits each batch
//! into tracks: tasks that share a declared resource land in the same track
//! and run one after another, everything else runs in parallel.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::dag::TaskGraph;
use crate::core::task::TaskId;
use crate::{clog_debug, Result};

/// An ordered group of topological batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sprint {
    /// 1-based position in the session.
    pub number: usize,
    pub batches: Vec<Vec<TaskId>>,
    pub effort_hours: f64,
}

impl Sprint {
    fn new(number: usize) -> Self {
        Self {
            number,
            batches: Vec::new(),
            effort_hours: 0.0,
        }
    }

    pub fn task_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.task_count() == 0
    }
}

#[derive(Debug, Clone)]
pub struct SprintScheduler {
    budget_hours: f64,
}

impl SprintScheduler {
    pub fn new(budget_hours: f64) -> Self {
        Self { budget_hours }
    }

    pub fn budget_hours(&self) -> f64 {
        self.budget_hours
    }

    /// Pack the graph's batches into sprints.
    ///
    /// A sprint closes when the next task would exceed the budget. A batch
    /// that overflows continues in the following sprint. A single task
    /// larger than the budget gets a sprint to itself.
    pub fn plan(&self, graph: &TaskGraph) -> Result<Vec<Sprint>> {
        let mut sprints = Vec::new();
        let mut current = Sprint::new(1);

        for batch in graph.topological_batches()? {
            current.batches.push(Vec::new());
            for id in batch {
                let effort = graph.task(&id)?.effort_hours;
                if !current.is_empty() && current.effort_hours + effort > self.budget_hours {
                    current.batches.retain(|b| !b.is_empty());
                    let number = current.number + 1;
                    sprints.push(std::mem::replace(&mut current, Sprint::new(number)));
                    current.batches.push(Vec::new());
                }
                current.effort_hours += effort;
                if let Some(last) = current.batches.last_mut() {
                    last.push(id);
                }
            }
        }

        current.batches.retain(|b| !b.is_empty());
        if !current.is_empty() {
            sprints.push(current);
        }
        clog_debug!(
            "Planned {} sprint(s) for {} task(s) at {}h budget",
            sprints.len(),
            graph.task_count(),
            self.budget_hours
        );
        Ok(sprints)
    }
}

/// Split one batch into track groups.
///
/// Tasks connected through any shared resource form one group, so a group
/// is the connected component of the "shares a resource" relation. Groups
/// are ordered by their first task name and tasks within a group by name.
pub fn assign_tracks(graph: &TaskGraph, batch: &[TaskId]) -> Result<Vec<Vec<TaskId>>> {
    let mut tasks = Vec::with_capacity(batch.len());
    for id in batch {
        tasks.push(graph.task(id)?);
    }
    tasks.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

    let mut parent: Vec<usize> = (0..tasks.len()).collect();
    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let mut owner: HashMap<&str, usize> = HashMap::new();
    for (i, task) in tasks.iter().enumerate() {
        for resource in &task.resources {
            match owner.get(resource.as_str()) {
                Some(&j) => {
                    let (a, b) = (root(&mut parent, i), root(&mut parent, j));
                    if a != b {
                        parent[a.max(b)] = a.min(b);
                    }
                }
                None => {
                    owner.insert(resource.as_str(), i);
                }
            }
        }
    }

    // Roots are the lowest index in their group, so BTreeMap order is
    // first-task-name order.
    let mut groups: BTreeMap<usize, Vec<TaskId>> = BTreeMap::new();
    for i in 0..tasks.len() {
        let r = root(&mut parent, i);
        groups.entry(r).or_default().push(tasks[i].id);
    }
    Ok(groups.into_values().collect())
}

/// Shared resources of a track group, for display.
pub fn group_resources(graph: &TaskGraph, group: &[TaskId]) -> BTreeSet<String> {
    group
        .iter()
        .filter_map(|id| graph.get_task(id))
        .flat_map(|t| t.resources.iter().cloned())
        .collect()
}
