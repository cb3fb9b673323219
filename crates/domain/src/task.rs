use serde::{Deserialize, Serialize};

use eventide_core::{Aggregate, DomainError, DomainEvent, DomainResult};

const MAX_TITLE_LEN: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    NotCreated,
    Todo,
    InProgress,
    Done,
}

/// Aggregate root: Task (domain `work`).
///
/// ```text
/// NotCreated --Create--> Todo --Start--> InProgress --Complete--> Done
///                         ^  (requires an assignee)                 |
///                         +----------------Reopen-------------------+
/// ```
///
/// `Assign` is accepted in `Todo` and `InProgress`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    status: TaskStatus,
    title: String,
    assignee: Option<String>,
    reopened: u32,
}

impl Task {
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn assignee(&self) -> Option<&str> {
        self.assignee.as_deref()
    }

    pub fn reopened(&self) -> u32 {
        self.reopened
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskCommand {
    Create { title: String },
    Assign { assignee: String },
    Start,
    Complete,
    Reopen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskEvent {
    Created { title: String },
    Assigned { assignee: String },
    Started,
    Completed,
    Reopened,
}

impl DomainEvent for TaskEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TaskEvent::Created { .. } => "task.created",
            TaskEvent::Assigned { .. } => "task.assigned",
            TaskEvent::Started => "task.started",
            TaskEvent::Completed => "task.completed",
            TaskEvent::Reopened => "task.reopened",
        }
    }
}

impl Aggregate for Task {
    const AGGREGATE_TYPE: &'static str = "task";
    const DOMAIN: &'static str = "work";

    type Command = TaskCommand;
    type Event = TaskEvent;

    fn apply(&mut self, event: &TaskEvent) {
        match event {
            TaskEvent::Created { title } => {
                self.status = TaskStatus::Todo;
                self.title = title.clone();
            }
            TaskEvent::Assigned { assignee } => self.assignee = Some(assignee.clone()),
            TaskEvent::Started => self.status = TaskStatus::InProgress,
            TaskEvent::Completed => self.status = TaskStatus::Done,
            TaskEvent::Reopened => {
                self.status = TaskStatus::Todo;
                self.reopened += 1;
            }
        }
    }

    fn decide(&self, command: &TaskCommand) -> DomainResult<Vec<TaskEvent>> {
        use TaskStatus::*;

        match (self.status, command) {
            (NotCreated, TaskCommand::Create { title }) => {
                let title = title.trim();
                if title.is_empty() {
                    return Err(DomainError::validation("title cannot be empty"));
                }
                if title.chars().count() > MAX_TITLE_LEN {
                    return Err(DomainError::validation(format!(
                        "title cannot exceed {MAX_TITLE_LEN} characters"
                    )));
                }
                Ok(vec![TaskEvent::Created {
                    title: title.to_string(),
                }])
            }
            (NotCreated, _) => Err(DomainError::not_found("task has not been created")),
            (_, TaskCommand::Create { .. }) => Err(DomainError::transition("task already exists")),

            (Todo | InProgress, TaskCommand::Assign { assignee }) => {
                let assignee = assignee.trim();
                if assignee.is_empty() {
                    return Err(DomainError::validation("assignee cannot be empty"));
                }
                if self.assignee.as_deref() == Some(assignee) {
                    return Err(DomainError::invariant(format!(
                        "task is already assigned to {assignee}"
                    )));
                }
                Ok(vec![TaskEvent::Assigned {
                    assignee: assignee.to_string(),
                }])
            }
            (Todo, TaskCommand::Start) => {
                if self.assignee.is_none() {
                    return Err(DomainError::invariant("task must be assigned before it starts"));
                }
                Ok(vec![TaskEvent::Started])
            }
            (InProgress, TaskCommand::Complete) => Ok(vec![TaskEvent::Completed]),
            (Done, TaskCommand::Reopen) => Ok(vec![TaskEvent::Reopened]),

            (Done, _) => Err(DomainError::transition(
                "task is completed; only reopen is allowed",
            )),
            (status, cmd) => Err(DomainError::transition(format!(
                "{} is not allowed while task is {status:?}",
                command_name(cmd)
            ))),
        }
    }
}

fn command_name(command: &TaskCommand) -> &'static str {
    match command {
        TaskCommand::Create { .. } => "create",
        TaskCommand::Assign { .. } => "assign",
        TaskCommand::Start => "start",
        TaskCommand::Complete => "complete",
        TaskCommand::Reopen => "reopen",
    }
}
