//! TOML plan files.
//!
//! A plan lists the tasks of a session and names their dependencies:
//!
//! ```toml
//! [[task]]
//! name = "schema"
//! kind = "design"
//!
//! [[task]]
//! name = "api"
//! kind = "implementation"
//! complexity = "high"
//! dependencies = ["schema"]
//! resources = ["src/api"]
//!
//! [[task.outputs]]
//! name = "handlers"
//!
//! [[task.outputs]]
//! name = "tests"
//! capability = "testing"
//!
//! [[task.criteria]]
//! id = "coverage"
//! statement = "every handler has a test"
//! output = "tests"
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::task::{
    Complexity, Criterion, OutputSpec, Task, TaskKind, DEFAULT_EFFORT_HOURS, DEFAULT_OUTPUT,
};
use crate::{clog_debug, Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    #[serde(rename = "task", default)]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub name: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default = "default_effort")]
    pub effort_hours: f64,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub criteria: Vec<Criterion>,
}

fn default_effort() -> f64 {
    DEFAULT_EFFORT_HOURS
}

impl TaskSpec {
    /// Build a fresh Pending task. Dependencies are wired by the graph.
    pub fn to_task(&self) -> Task {
        let outputs = if self.outputs.is_empty() {
            vec![OutputSpec::new(DEFAULT_OUTPUT)]
        } else {
            self.outputs.clone()
        };
        let mut task = Task::new(&self.name, self.kind)
            .with_description(&self.description)
            .with_complexity(self.complexity)
            .with_effort(self.effort_hours)
            .with_outputs(outputs);
        task.resources = self.resources.clone();
        task.acceptance_criteria = self.criteria.clone();
        task
    }
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        clog_debug!("Plan::load path={}", path.display());
        Self::from_toml(&fs::read_to_string(path)?)
    }

    pub fn from_toml(source: &str) -> Result<Self> {
        let plan: Self = toml::from_str(source)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Check names, references, and numeric fields.
    ///
    /// Cycles are not checked here; the graph rejects them as edges are added.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for spec in &self.tasks {
            if spec.name.trim().is_empty() {
                return Err(Error::Validation("task name must not be empty".into()));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(Error::Validation(format!("duplicate task name: {}", spec.name)));
            }
            if spec.effort_hours.is_nan() || spec.effort_hours < 0.0 {
                return Err(Error::Validation(format!(
                    "task {} has invalid effort_hours {}",
                    spec.name, spec.effort_hours
                )));
            }

            let mut outputs = HashSet::new();
            for output in &spec.outputs {
                if !outputs.insert(output.name.as_str()) {
                    return Err(Error::Validation(format!(
                        "task {} declares output {} twice",
                        spec.name, output.name
                    )));
                }
            }
            if outputs.is_empty() {
                outputs.insert(DEFAULT_OUTPUT);
            }
            for criterion in &spec.criteria {
                if let Some(output) = &criterion.output {
                    if !outputs.contains(output.as_str()) {
                        return Err(Error::Validation(format!(
                            "criterion {} of task {} names unknown output {}",
                            criterion.id, spec.name, output
                        )));
                    }
                }
            }
        }

        for spec in &self.tasks {
            for dep in &spec.dependencies {
                if !names.contains(dep.as_str()) {
                    return Err(Error::TaskNotFound(dep.clone()));
                }
            }
        }
        Ok(())
    }
}
