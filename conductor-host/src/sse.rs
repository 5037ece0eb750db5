//! Server-Sent Events stream and file watcher.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::path::Path;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::{AppState, HostEvent};

#[derive(Serialize)]
struct ChangePayload<'a> {
    #[serde(rename = "type")]
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<&'a str>,
}

impl<'a> ChangePayload<'a> {
    fn plain(event_type: &'static str) -> Self {
        Self {
            event_type,
            run_id: None,
            task_id: None,
        }
    }
}

/// Render a host event as an SSE frame. Runner activity goes out as `run`,
/// file changes as `change`.
fn to_sse_event(event: &HostEvent) -> Option<Event> {
    let (name, json) = match event {
        HostEvent::Run(run_event) => ("run", serde_json::to_string(run_event)),
        HostEvent::TasksChanged => ("change", serde_json::to_string(&ChangePayload::plain("tasks_changed"))),
        HostEvent::BranchesChanged => (
            "change",
            serde_json::to_string(&ChangePayload::plain("branches_changed")),
        ),
        HostEvent::MergeStateChanged => (
            "change",
            serde_json::to_string(&ChangePayload::plain("merge_state_changed")),
        ),
        HostEvent::ConfigChanged => (
            "change",
            serde_json::to_string(&ChangePayload::plain("config_changed")),
        ),
        HostEvent::PolicyChanged => (
            "change",
            serde_json::to_string(&ChangePayload::plain("policy_changed")),
        ),
        HostEvent::TranscriptWritten { run_id, task_id } => (
            "change",
            serde_json::to_string(&ChangePayload {
                event_type: "transcript_written",
                run_id: Some(run_id),
                task_id: Some(task_id),
            }),
        ),
    };
    match json {
        Ok(data) => Some(Event::default().event(name).data(data)),
        Err(err) => {
            warn!(error = %err, "failed to encode SSE payload");
            None
        }
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(host_event) => {
                    if let Some(event) = to_sse_event(&host_event) {
                        yield Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Start the file watcher in a background task.
pub fn start_file_watcher(state: AppState) {
    tokio::spawn(async move {
        if let Err(e) = run_file_watcher(state).await {
            warn!(error = %e, "file watcher failed");
        }
    });
}

async fn run_file_watcher(state: AppState) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(250)),
    )?;

    let conductor_dir = &state.paths.conductor_dir;
    if conductor_dir.exists() {
        watcher.watch(conductor_dir, RecursiveMode::Recursive)?;
        info!(path = %conductor_dir.display(), "watching conductor directory");
    } else {
        warn!(path = %conductor_dir.display(), "conductor directory missing; file changes will not be streamed");
    }

    // Batch so a burst of atomic writes turns into one event per kind.
    let mut pending_events: Vec<NotifyEvent> = Vec::new();
    let mut flush_tick = tokio::time::interval(Duration::from_millis(100));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                pending_events.push(event);
            }
            _ = flush_tick.tick() => {
                if pending_events.is_empty() {
                    continue;
                }
                process_events(&state, &pending_events);
                pending_events.clear();
            }
        }
    }
}

#[derive(Default)]
struct Changes {
    tasks: bool,
    branches: bool,
    merge_state: bool,
    config: bool,
    policy: bool,
    transcripts: BTreeSet<(String, String)>,
}

fn process_events(state: &AppState, events: &[NotifyEvent]) {
    let paths = &state.paths;
    let mut changes = Changes::default();

    for event in events {
        let removed = matches!(event.kind, EventKind::Remove(_));
        if !removed && !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }

        for path in &event.paths {
            if path == &paths.merge_state_path {
                // Removal means the merge finished or was aborted.
                changes.merge_state = true;
            } else if removed {
                continue;
            } else if path == &paths.tasks_path {
                changes.tasks = true;
            } else if path == &paths.branches_path || path == &paths.review_branch_path {
                changes.branches = true;
            } else if path == &paths.config_path {
                changes.config = true;
            } else if path == &paths.policy_path {
                changes.policy = true;
            } else if let Some(key) = parse_transcript_path(&paths.runs_dir, path) {
                changes.transcripts.insert(key);
            }
        }
    }

    let send = |event: HostEvent| {
        debug!(?event, "broadcasting change");
        let _ = state.event_tx.send(event);
    };
    if changes.tasks {
        send(HostEvent::TasksChanged);
    }
    if changes.branches {
        send(HostEvent::BranchesChanged);
    }
    if changes.merge_state {
        send(HostEvent::MergeStateChanged);
    }
    if changes.config {
        send(HostEvent::ConfigChanged);
    }
    if changes.policy {
        send(HostEvent::PolicyChanged);
    }
    for (run_id, task_id) in changes.transcripts {
        send(HostEvent::TranscriptWritten { run_id, task_id });
    }
}

/// `runs/<run_id>/<task_id>/transcript.json` -> `(run_id, task_id)`.
fn parse_transcript_path(runs_dir: &Path, path: &Path) -> Option<(String, String)> {
    let rel = path.strip_prefix(runs_dir).ok()?;
    let mut components = rel.components();

    let run_id = components.next()?.as_os_str().to_str()?.to_string();
    let task_id = components.next()?.as_os_str().to_str()?.to_string();
    let file = components.next()?.as_os_str().to_str()?;
    if file != "transcript.json" || components.next().is_some() {
        return None;
    }
    Some((run_id, task_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use conductor::io::config::ConductorConfig;
    use conductor::io::init::ConductorPaths;
    use conductor::test_support::ScriptedProvider;

    fn state() -> AppState {
        let project_dir = std::env::temp_dir()
            .join("conductor-host-tests")
            .join(format!("pid-{}", std::process::id()));
        AppState::with_provider(
            ConductorPaths::new(project_dir),
            ConductorConfig::default(),
            Arc::new(ScriptedProvider::new(Vec::new())),
        )
    }

    fn event(kind: EventKind, path: PathBuf) -> NotifyEvent {
        NotifyEvent {
            kind,
            paths: vec![path],
            attrs: Default::default(),
        }
    }

    fn modify(path: PathBuf) -> NotifyEvent {
        event(EventKind::Modify(notify::event::ModifyKind::Any), path)
    }

    fn drain(rx: &mut broadcast::Receiver<HostEvent>) -> Vec<HostEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn repeated_writes_collapse_into_one_event() {
        let state = state();
        let mut rx = state.event_tx.subscribe();
        let tasks = state.paths.tasks_path.clone();
        let branches = state.paths.branches_path.clone();

        process_events(
            &state,
            &[modify(tasks.clone()), modify(tasks), modify(branches)],
        );

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], HostEvent::TasksChanged));
        assert!(matches!(events[1], HostEvent::BranchesChanged));
    }

    #[test]
    fn transcript_write_names_run_and_task() {
        let state = state();
        let mut rx = state.event_tx.subscribe();
        let path = state.paths.transcript_path("run-x", "7");
        let stray = state.paths.runs_dir.join("run-x").join("7").join("notes.txt");

        process_events(&state, &[modify(path), modify(stray)]);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(
            matches!(&events[0], HostEvent::TranscriptWritten { run_id, task_id } if run_id == "run-x" && task_id == "7")
        );
    }

    #[test]
    fn merge_state_removal_is_reported() {
        let state = state();
        let mut rx = state.event_tx.subscribe();
        let merge_state = state.paths.merge_state_path.clone();
        let tasks = state.paths.tasks_path.clone();

        process_events(
            &state,
            &[
                event(EventKind::Remove(notify::event::RemoveKind::File), merge_state),
                event(EventKind::Remove(notify::event::RemoveKind::File), tasks),
            ],
        );

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], HostEvent::MergeStateChanged));
    }

    #[test]
    fn transcript_path_parsing() {
        let runs = Path::new("/p/.conductor/runs");
        assert_eq!(
            parse_transcript_path(runs, &runs.join("r1/t1/transcript.json")),
            Some(("r1".to_string(), "t1".to_string()))
        );
        assert_eq!(parse_transcript_path(runs, &runs.join("r1/transcript.json")), None);
        assert_eq!(parse_transcript_path(Path::new("/elsewhere"), &runs.join("r1/t1/transcript.json")), None);
    }
}
