//! Task records and the status state machine
//!
//! Status transitions:
//! ```text
//! Todo ↔ InProgress ↔ Blocked
//!   ↓        ↓
//!  Done ←────┘        (Blocked → Done is not allowed)
//!   ↓
//! reopen → Todo
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CtxError, Result};
use crate::ids::validate_id;
use crate::record::RecordKey;

/// The status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started
    #[default]
    Todo,
    /// Being worked on
    InProgress,
    /// Waiting on something outside the task
    Blocked,
    /// Finished; only `reopen` leaves this state
    Done,
}

impl TaskStatus {
    /// Check if a status update is allowed. Same-status updates are allowed
    /// and leave the task unchanged.
    pub fn can_transition_to(self, target: TaskStatus) -> bool {
        match (self, target) {
            (from, to) if from == to => true,

            // Done is terminal for ordinary updates
            (TaskStatus::Done, _) => false,

            // Blocked work goes back through InProgress first
            (TaskStatus::Blocked, TaskStatus::Done) => false,

            _ => true,
        }
    }

    /// Get valid next statuses from the current one
    pub fn valid_transitions(self) -> Vec<TaskStatus> {
        match self {
            TaskStatus::Todo => vec![
                TaskStatus::InProgress,
                TaskStatus::Blocked,
                TaskStatus::Done,
            ],
            TaskStatus::InProgress => {
                vec![TaskStatus::Todo, TaskStatus::Blocked, TaskStatus::Done]
            }
            TaskStatus::Blocked => vec![TaskStatus::Todo, TaskStatus::InProgress],
            TaskStatus::Done => vec![],
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CtxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "todo" => Ok(TaskStatus::Todo),
            "in_progress" => Ok(TaskStatus::InProgress),
            "blocked" => Ok(TaskStatus::Blocked),
            "done" => Ok(TaskStatus::Done),
            other => Err(CtxError::InvalidInput(format!("unknown status: {}", other))),
        }
    }
}

/// Task priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Priority {
    type Err = CtxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(CtxError::InvalidInput(format!("unknown priority: {}", other))),
        }
    }
}

/// A stored task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub task_tree_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub assignee: Option<String>,
    /// Ids of tasks in the same project this one waits on
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn from_new(
        project_id: impl Into<String>,
        task_tree_id: impl Into<String>,
        new: NewTask,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new.id,
            project_id: project_id.into(),
            task_tree_id: task_tree_id.into(),
            title: new.title,
            description: new.description,
            status: TaskStatus::Todo,
            priority: new.priority,
            assignee: new.assignee,
            dependencies: new.dependencies,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_key(&self) -> RecordKey {
        RecordKey::task(
            self.project_id.as_str(),
            self.task_tree_id.as_str(),
            self.id.as_str(),
        )
    }

    pub fn depends_on(&self, id: &str) -> bool {
        self.dependencies.contains(id)
    }
}

/// Caller input for task creation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
}

impl NewTask {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_id("task id", &self.id)?;
        if self.title.trim().is_empty() {
            return Err(CtxError::InvalidInput(format!(
                "task {} has an empty title",
                self.id
            )));
        }
        for dep in &self.dependencies {
            validate_id("dependency id", dep)?;
        }
        Ok(())
    }
}

/// Partial update of a task's descriptive fields.
///
/// `description` and `assignee` are doubly optional: `Some(None)` clears the
/// field, `None` leaves it alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<Option<String>>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub assignee: Option<Option<String>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.assignee.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(title) = &self.title {
            if title.trim().is_empty() {
                return Err(CtxError::InvalidInput("title must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Apply to `task`, returning whether anything changed.
    pub fn apply(&self, task: &mut Task) -> bool {
        let mut changed = false;
        if let Some(title) = &self.title {
            changed |= task.title != *title;
            task.title = title.clone();
        }
        if let Some(description) = &self.description {
            changed |= task.description != *description;
            task.description = description.clone();
        }
        if let Some(priority) = self.priority {
            changed |= task.priority != priority;
            task.priority = priority;
        }
        if let Some(assignee) = &self.assignee {
            changed |= task.assignee != *assignee;
            task.assignee = assignee.clone();
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskStatus::Todo, TaskStatus::InProgress, true)]
    #[case(TaskStatus::Todo, TaskStatus::Done, true)]
    #[case(TaskStatus::InProgress, TaskStatus::Blocked, true)]
    #[case(TaskStatus::InProgress, TaskStatus::Done, true)]
    #[case(TaskStatus::Blocked, TaskStatus::InProgress, true)]
    #[case(TaskStatus::Blocked, TaskStatus::Todo, true)]
    #[case(TaskStatus::Blocked, TaskStatus::Done, false)]
    #[case(TaskStatus::Done, TaskStatus::Todo, false)]
    #[case(TaskStatus::Done, TaskStatus::InProgress, false)]
    #[case(TaskStatus::Done, TaskStatus::Done, true)]
    #[case(TaskStatus::Blocked, TaskStatus::Blocked, true)]
    fn test_transition_table(
        #[case] from: TaskStatus,
        #[case] to: TaskStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_valid_transitions_agree_with_table() {
        for from in [
            TaskStatus::Todo,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Done,
        ] {
            for to in from.valid_transitions() {
                assert!(from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(
            serde_json::to_value(TaskStatus::InProgress).unwrap(),
            serde_json::json!("in_progress")
        );
        assert_eq!("blocked".parse::<TaskStatus>().unwrap(), TaskStatus::Blocked);
        assert!("finished".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_new_task_validation() {
        assert!(NewTask::new("t1", "Write docs").validate().is_ok());
        assert!(NewTask::new("", "Write docs").validate().is_err());
        assert!(NewTask::new("t1", "  ").validate().is_err());
    }

    #[test]
    fn test_patch_apply() {
        let new = NewTask::new("t1", "Draft")
            .with_assignee("sam")
            .with_priority(Priority::Low);
        let mut task = Task::from_new("p1", "tree-a", new, Utc::now());

        let patch = TaskPatch {
            title: Some("Final".into()),
            assignee: Some(None),
            ..Default::default()
        };
        assert!(patch.apply(&mut task));
        assert_eq!(task.title, "Final");
        assert_eq!(task.assignee, None);
        assert_eq!(task.priority, Priority::Low);

        assert!(!patch.apply(&mut task));
        assert!(TaskPatch::default().is_empty());
    }

    #[test]
    fn test_task_round_trips_through_json() {
        let new = NewTask::new("t2", "Ship").depends_on("t1");
        let task = Task::from_new("p1", "tree-a", new, Utc::now());
        let value = serde_json::to_value(&task).unwrap();
        let back: Task = serde_json::from_value(value).unwrap();
        assert_eq!(back, task);
        assert!(back.depends_on("t1"));
    }
}
