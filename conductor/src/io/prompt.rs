//! Prompt rendering for task runs.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::{CommentKind, Task, TaskComment};
use crate::io::provider::Message;
use crate::io::tools::CompletionMode;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// Earlier comments carried into the next attempt.
const MAX_NOTES: usize = 5;

#[derive(Debug, Serialize)]
struct Note<'a> {
    kind: CommentKind,
    content: &'a str,
}

/// Build the opening conversation for a task run.
pub fn initial_messages(task: &Task, branch: Option<&str>, mode: CompletionMode) -> Result<Vec<Message>> {
    let env = Environment::new();
    let mode_name = match mode {
        CompletionMode::Agent => "agent",
        CompletionMode::Ask => "ask",
    };
    let system = env
        .render_str(SYSTEM_TEMPLATE, context! { mode => mode_name })
        .context("render system prompt")?;

    let relevant: Vec<&TaskComment> = task
        .comments
        .iter()
        .filter(|c| !matches!(c.kind, CommentKind::Progress | CommentKind::Summary))
        .collect();
    let notes: Vec<Note<'_>> = relevant[relevant.len().saturating_sub(MAX_NOTES)..]
        .iter()
        .map(|c| Note {
            kind: c.kind,
            content: c.content.trim(),
        })
        .collect();
    let user = env
        .render_str(
            TASK_TEMPLATE,
            context! {
                task => task,
                branch => branch,
                notes => notes,
            },
        )
        .context("render task prompt")?;

    Ok(vec![
        Message::system(system.trim()),
        Message::user(user.trim()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Author, TaskComment};
    use crate::io::provider::Role;
    use chrono::Utc;

    #[test]
    fn renders_task_with_criteria_branch_and_notes() {
        let mut task = Task::new("T-1", "Add health endpoint");
        task.description = "Expose GET /health.".to_string();
        task.acceptance_criteria = vec!["returns 200".to_string(), "has a test".to_string()];
        task.comments.push(TaskComment {
            id: 1,
            kind: CommentKind::Failure,
            author: Author::System,
            content: "maxStepsPerRun exceeded".to_string(),
            run_id: None,
            created_at: Utc::now(),
            resolved: true,
        });
        task.comments.push(TaskComment {
            id: 2,
            kind: CommentKind::Progress,
            author: Author::Agent,
            content: "halfway".to_string(),
            run_id: None,
            created_at: Utc::now(),
            resolved: true,
        });

        let messages =
            initial_messages(&task, Some("task/T-1-add-health-endpoint"), CompletionMode::Agent)
                .expect("render");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("write files"));

        let user = &messages[1].content;
        assert!(user.starts_with("# Task T-1: Add health endpoint"));
        assert!(user.contains("- returns 200"));
        assert!(user.contains("task/T-1-add-health-endpoint"));
        assert!(user.contains("[failure] maxStepsPerRun exceeded"));
        assert!(!user.contains("halfway"));
    }

    #[test]
    fn ask_mode_is_read_only() {
        let task = Task::new("T-2", "Explain module");
        let messages = initial_messages(&task, None, CompletionMode::Ask).expect("render");
        assert!(messages[0].content.contains("only read files"));
        assert!(!messages[1].content.contains("branch"));
    }
}
