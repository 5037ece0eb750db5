//! End-to-end runner tests against real temp git repositories.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use conductor::autorun::{RunEvent, RunHandle, RunOptions, RunStatus, StopReason, TaskRunner};
use conductor::core::types::{Author, CommentKind, OrderingStrategy, Task, TaskStatus};
use conductor::io::task_store::TaskStore;
use conductor::test_support::{ScriptedProvider, ScriptedStep, TestProject};

fn runner(project: &TestProject, provider: ScriptedProvider) -> TaskRunner {
    TaskRunner::new(
        project.paths.clone(),
        project.config.clone(),
        project.task_store(),
        Arc::new(provider),
    )
}

fn wait_for(handle: &RunHandle, status: RunStatus) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while handle.status() != status {
        assert!(Instant::now() < deadline, "timed out waiting for {status:?}");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn pause_mid_task_lets_task_finish_then_halts() {
    let project = TestProject::new().expect("project");
    project.add_task("1", "First").expect("task");
    project.add_task("2", "Second").expect("task");

    let handle_slot: Arc<OnceLock<RunHandle>> = Arc::new(OnceLock::new());
    let slot = Arc::clone(&handle_slot);
    let provider = ScriptedProvider::new(Vec::new()).with_hook(move |call| {
        if call == 0
            && let Some(handle) = slot.get()
        {
            handle.pause();
        }
    });
    let runner = runner(&project, provider);
    let handle = runner.handle();
    handle_slot.set(handle.clone()).expect("set handle");

    let worker = thread::spawn(move || runner.start(RunOptions::default()));
    wait_for(&handle, RunStatus::Paused);

    assert_eq!(project.task("1").expect("task").status, TaskStatus::Review);
    assert_eq!(project.task("2").expect("task").status, TaskStatus::Todo);
    assert_eq!(handle.progress().completed, 1);

    handle.stop();
    let summary = worker.join().expect("join").expect("run");
    assert_eq!(summary.stopped_reason, StopReason::StoppedByOperator);
    assert_eq!(summary.processed, 1);
    assert_eq!(project.task("2").expect("task").status, TaskStatus::Todo);
}

#[test]
fn resume_continues_with_remaining_tasks() {
    let project = TestProject::new().expect("project");
    project.add_task("1", "First").expect("task");
    project.add_task("2", "Second").expect("task");

    let handle_slot: Arc<OnceLock<RunHandle>> = Arc::new(OnceLock::new());
    let slot = Arc::clone(&handle_slot);
    let provider = ScriptedProvider::new(Vec::new()).with_hook(move |call| {
        if call == 0
            && let Some(handle) = slot.get()
        {
            handle.pause();
        }
    });
    let runner = runner(&project, provider);
    let handle = runner.handle();
    handle_slot.set(handle.clone()).expect("set handle");

    let worker = thread::spawn(move || runner.start(RunOptions::default()));
    wait_for(&handle, RunStatus::Paused);
    handle.resume();

    let summary = worker.join().expect("join").expect("run");
    assert_eq!(summary.stopped_reason, StopReason::NoEligibleTasks);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.completed, 2);
}

#[test]
fn stop_cancels_in_flight_task() {
    let project = TestProject::new().expect("project");
    project.add_task("1", "Long running").expect("task");
    project.add_task("2", "Never started").expect("task");

    let handle_slot: Arc<OnceLock<RunHandle>> = Arc::new(OnceLock::new());
    let slot = Arc::clone(&handle_slot);
    let provider = ScriptedProvider::new(Vec::new()).with_hook(move |_| {
        if let Some(handle) = slot.get() {
            handle.stop();
        }
    });
    let runner = runner(&project, provider);
    handle_slot.set(runner.handle()).expect("set handle");

    let summary = runner.start(RunOptions::default()).expect("run");
    assert_eq!(summary.stopped_reason, StopReason::StoppedByOperator);
    assert_eq!(summary.processed, 1);

    let task = project.task("1").expect("task");
    assert_eq!(task.status, TaskStatus::Failed);
    let comment = task.comments.last().expect("comment");
    assert_eq!(comment.kind, CommentKind::Failure);
    assert_eq!(comment.content, "cancelled");
    assert_eq!(project.task("2").expect("task").status, TaskStatus::Todo);
}

#[test]
fn cancelled_task_does_not_count_toward_max_failures() {
    let project = TestProject::new().expect("project");
    project.add_task("1", "Cancelled").expect("task");
    project.add_task("2", "Runs").expect("task");

    let provider = ScriptedProvider::new(vec![ScriptedStep::CancelAfter("partial".to_string())]);
    let summary = runner(&project, provider)
        .start(RunOptions {
            max_failures: Some(1),
            ..RunOptions::default()
        })
        .expect("run");
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.stopped_reason, StopReason::NoEligibleTasks);
    assert_eq!(project.task("1").expect("task").status, TaskStatus::Failed);
    assert_eq!(project.task("2").expect("task").status, TaskStatus::Review);
}

#[test]
fn dependency_order_runs_prerequisites_first() {
    let project = TestProject::new().expect("project");
    let mut api = Task::new("api", "Build API");
    api.depends_on = vec!["schema".to_string()];
    project.store.insert_task(api).expect("insert");
    project.add_task("schema", "Design schema").expect("task");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let provider = ScriptedProvider::new(Vec::new());
    let runner = runner(&project, provider).with_events(Arc::new(move |event: RunEvent| {
        if let RunEvent::TaskFinished { task_id, .. } = event {
            sink.lock().expect("lock").push(task_id);
        }
    }));
    let summary = runner
        .start(RunOptions {
            strategy: OrderingStrategy::Dependency,
            ..RunOptions::default()
        })
        .expect("run");
    assert_eq!(summary.processed, 2);
    assert_eq!(
        *seen.lock().expect("lock"),
        vec!["schema".to_string(), "api".to_string()]
    );
}

#[test]
fn unresolved_question_holds_task_back() {
    let project = TestProject::new().expect("project");
    project.add_task("1", "Ambiguous").expect("task");
    let comment = project
        .store
        .add_typed_comment(
            "1",
            CommentKind::Question,
            Author::Agent,
            "Which database?",
            None,
        )
        .expect("comment");

    let summary = runner(&project, ScriptedProvider::new(Vec::new()))
        .start(RunOptions::default())
        .expect("run");
    assert_eq!(summary.processed, 0);

    project.store.resolve_comment("1", comment.id).expect("resolve");
    let summary = runner(&project, ScriptedProvider::new(Vec::new()))
        .start(RunOptions::default())
        .expect("run");
    assert_eq!(summary.processed, 1);
}

#[test]
fn concurrent_starts_admit_a_single_run() {
    let project = TestProject::new().expect("project");
    for id in ["1", "2", "3", "4"] {
        project.add_task(id, "Parallel").expect("task");
    }

    let rejected = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&rejected);
    // Hold the first task until the competing start has been turned away.
    let provider = ScriptedProvider::new(Vec::new()).with_hook(move |call| {
        if call == 0 {
            let deadline = Instant::now() + Duration::from_secs(10);
            while seen.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
        }
    });
    let runner = Arc::new(runner(&project, provider));
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let runner = Arc::clone(&runner);
            let barrier = Arc::clone(&barrier);
            let rejected = Arc::clone(&rejected);
            thread::spawn(move || {
                barrier.wait();
                let result = runner.start(RunOptions::default());
                if result.is_err() {
                    rejected.fetch_add(1, Ordering::SeqCst);
                }
                result
            })
        })
        .collect();
    let results: Vec<_> = workers
        .into_iter()
        .map(|w| w.join().expect("join"))
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(rejected.load(Ordering::SeqCst), 1);
    let summary = results
        .into_iter()
        .find_map(Result::ok)
        .expect("winning run");
    assert_eq!(summary.processed, 4);
    assert!(!runner.handle().is_active());
}

#[test]
fn tasks_added_mid_run_wait_for_the_next_run() {
    let project = TestProject::new().expect("project");
    project.add_task("1", "First").expect("task");

    let store = project.task_store();
    let provider = ScriptedProvider::new(Vec::new()).with_hook(move |call| {
        if call == 0 {
            store.insert_task(Task::new("9", "Late")).expect("insert");
        }
    });
    let summary = runner(&project, provider)
        .start(RunOptions::default())
        .expect("run");
    assert_eq!(summary.total, 1);
    assert_eq!(summary.processed, 1);
    assert!(summary.completed + summary.failed + summary.blocked <= summary.total);
    assert_eq!(project.task("9").expect("task").status, TaskStatus::Todo);

    let summary = runner(&project, ScriptedProvider::new(Vec::new()))
        .start(RunOptions::default())
        .expect("run");
    assert_eq!(summary.total, 1);
    assert_eq!(summary.processed, 1);
}
