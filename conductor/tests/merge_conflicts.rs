//! Conflict handling across the runner and the orchestrator.

use std::sync::Arc;

use conductor::autorun::{RunOptions, TaskRunner};
use conductor::core::tool_call::ToolCall;
use conductor::core::types::{CommentKind, Initiator, TaskStatus};
use conductor::io::provider::Completion;
use conductor::test_support::{ScriptedProvider, ScriptedStep, TestProject};
use serde_json::json;

#[test]
fn review_conflict_leaves_task_in_review_with_comment() {
    let project = TestProject::new().expect("project");
    let git = project.repo.git();
    project.repo.write("shared.txt", "base\n").expect("write");
    project.repo.commit_all("base").expect("commit");

    // The review branch diverges from main on the same file.
    git.create_branch("review", false).expect("review branch");
    git.checkout("review").expect("checkout review");
    project.repo.write("shared.txt", "review\n").expect("write");
    project.repo.commit_all("review edit").expect("commit");
    git.checkout("main").expect("checkout main");

    project.add_task("1", "Edit shared").expect("task");
    let provider = ScriptedProvider::new(vec![
        ScriptedStep::Reply(Completion {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "w".to_string(),
                name: "write_file".to_string(),
                arguments: json!({"path": "shared.txt", "content": "task\n"}),
            }],
            finish_reason: None,
        }),
        ScriptedStep::Reply(Completion {
            content: "Edited shared.txt".to_string(),
            ..Completion::default()
        }),
    ]);
    let runner = TaskRunner::new(
        project.paths.clone(),
        project.config.clone(),
        project.task_store(),
        Arc::new(provider),
    );
    let summary = runner.start(RunOptions::default()).expect("run");
    assert_eq!(summary.completed, 1);

    let task = project.task("1").expect("task");
    assert_eq!(task.status, TaskStatus::Review);
    let conflict = task
        .comments
        .iter()
        .find(|c| c.kind == CommentKind::Conflict)
        .expect("conflict comment");
    assert!(conflict.content.contains("shared.txt"));

    assert!(!git.merge_in_progress().expect("merge state"));
    assert!(runner.orchestrator().merge_state().expect("state").is_none());
    let mapping = runner
        .orchestrator()
        .mapping_for("1")
        .expect("mapping")
        .expect("present");
    assert!(!mapping.is_merged);

    // The operator can still take the task straight to main.
    let outcome = runner
        .orchestrator()
        .merge_task_to_main("1", Initiator::Operator)
        .expect("merge to main");
    assert!(!outcome.had_conflicts);
    assert!(outcome.warnings.iter().any(|w| w.contains("bypasses review")));
    assert_eq!(project.repo.read("shared.txt").expect("read"), "task\n");
}

#[test]
fn operation_log_records_every_git_change() {
    let project = TestProject::new().expect("project");
    project.add_task("1", "Logged").expect("task");
    let runner = TaskRunner::new(
        project.paths.clone(),
        project.config.clone(),
        project.task_store(),
        Arc::new(ScriptedProvider::new(vec![ScriptedStep::Reply(Completion {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "w".to_string(),
                name: "write_file".to_string(),
                arguments: json!({"path": "notes.md", "content": "notes\n"}),
            }],
            finish_reason: None,
        })])),
    );
    runner.start(RunOptions::default()).expect("run");

    let ops: Vec<String> = runner
        .orchestrator()
        .operation_log()
        .entries_for_task("1")
        .expect("entries")
        .into_iter()
        .map(|e| e.operation)
        .collect();
    assert_eq!(ops.first().map(String::as_str), Some("create_branch"));
    assert!(ops.contains(&"commit".to_string()));
    assert!(ops.contains(&"merge".to_string()));
    assert!(ops.iter().all(|op| !op.is_empty()));
}
