//! End-to-end conduction scenarios
//!
//! Each test drives a conductor the way an external executor would: request
//! the running state, harvest the start tasks, report execution events, and
//! harvest the next tasks after each completion.

use anyhow::Result;
use serde_json::json;

use baton_core::{
    Barrier, ConductorError, TaskDescriptor, TaskSpec, TransitionSpec, WorkflowConductor,
    WorkflowSpec,
};
use baton_events::{ExecutionEvent, ExecutionEventKind, TaskState, WorkflowState};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Transition fired when the source task succeeds
fn on_success(src: &str, dst: &str) -> TransitionSpec {
    TransitionSpec::new()
        .when(&format!("{{{{ succeeded('{src}') }}}}"))
        .then(dst)
}

fn names(tasks: &[TaskDescriptor]) -> Vec<String> {
    tasks.iter().map(|task| task.name.clone()).collect()
}

fn start(spec: WorkflowSpec) -> Result<WorkflowConductor> {
    init_logging();
    let mut conductor = WorkflowConductor::new(spec, None, None)?;
    conductor.request_workflow_state(WorkflowState::Running)?;
    Ok(conductor)
}

/// Report started and succeeded for a task, returning the follow-on names
fn complete(conductor: &mut WorkflowConductor, task_id: &str) -> Result<Vec<String>> {
    conductor.update_task_flow(task_id, ExecutionEvent::started())?;
    conductor.update_task_flow(task_id, ExecutionEvent::succeeded(json!({"task": task_id})))?;
    Ok(names(&conductor.get_next_tasks(Some(task_id))?))
}

fn sequential_spec() -> WorkflowSpec {
    WorkflowSpec::new("template")
        .with_task(
            "task1",
            TaskSpec::new("core.echo").with_next(on_success("task1", "task2")),
        )
        .with_task(
            "task2",
            TaskSpec::new("core.echo").with_next(on_success("task2", "task3")),
        )
        .with_task("task3", TaskSpec::new("core.echo"))
}

#[test]
fn test_sequential() -> Result<()> {
    let mut conductor = start(sequential_spec())?;

    assert_eq!(names(&conductor.get_start_tasks()?), vec!["task1"]);
    assert_eq!(complete(&mut conductor, "task1")?, vec!["task2"]);
    assert_eq!(complete(&mut conductor, "task2")?, vec!["task3"]);
    assert!(complete(&mut conductor, "task3")?.is_empty());

    assert_eq!(conductor.get_workflow_state(), WorkflowState::Succeeded);
    Ok(())
}

#[test]
fn test_parallel_branches() -> Result<()> {
    let spec = WorkflowSpec::new("template")
        .with_task(
            "task1",
            TaskSpec::new("core.echo").with_next(on_success("task1", "task2")),
        )
        .with_task(
            "task2",
            TaskSpec::new("core.echo").with_next(on_success("task2", "task3")),
        )
        .with_task("task3", TaskSpec::new("core.echo"))
        .with_task(
            "task4",
            TaskSpec::new("core.echo").with_next(on_success("task4", "task5")),
        )
        .with_task(
            "task5",
            TaskSpec::new("core.echo").with_next(on_success("task5", "task6")),
        )
        .with_task("task6", TaskSpec::new("core.echo"));

    let mut conductor = start(spec)?;

    assert_eq!(names(&conductor.get_start_tasks()?), vec!["task1", "task4"]);

    // Interleave the branches; each completion only unlocks its own branch.
    assert_eq!(complete(&mut conductor, "task1")?, vec!["task2"]);
    assert_eq!(complete(&mut conductor, "task4")?, vec!["task5"]);
    assert_eq!(complete(&mut conductor, "task2")?, vec!["task3"]);
    assert_eq!(complete(&mut conductor, "task5")?, vec!["task6"]);
    assert!(complete(&mut conductor, "task3")?.is_empty());
    assert_eq!(conductor.get_workflow_state(), WorkflowState::Running);
    assert!(complete(&mut conductor, "task6")?.is_empty());

    assert_eq!(conductor.get_workflow_state(), WorkflowState::Succeeded);

    let completed: Vec<String> = conductor
        .get_task_flow()?
        .sequence
        .iter()
        .map(|entry| entry.id.clone())
        .collect();
    assert_eq!(
        completed,
        vec!["task1", "task4", "task2", "task5", "task3", "task6"]
    );
    Ok(())
}

#[test]
fn test_branching() -> Result<()> {
    let spec = WorkflowSpec::new("template")
        .with_task(
            "task1",
            TaskSpec::new("core.echo")
                .with_next(on_success("task1", "task2"))
                .with_next(on_success("task1", "task4")),
        )
        .with_task(
            "task2",
            TaskSpec::new("core.echo").with_next(on_success("task2", "task3")),
        )
        .with_task("task3", TaskSpec::new("core.echo"))
        .with_task(
            "task4",
            TaskSpec::new("core.echo").with_next(on_success("task4", "task5")),
        )
        .with_task("task5", TaskSpec::new("core.echo"));

    let mut conductor = start(spec)?;

    assert_eq!(names(&conductor.get_start_tasks()?), vec!["task1"]);
    assert_eq!(complete(&mut conductor, "task1")?, vec!["task2", "task4"]);
    assert_eq!(complete(&mut conductor, "task2")?, vec!["task3"]);
    assert_eq!(complete(&mut conductor, "task4")?, vec!["task5"]);
    assert!(complete(&mut conductor, "task3")?.is_empty());
    assert!(complete(&mut conductor, "task5")?.is_empty());

    assert_eq!(conductor.get_workflow_state(), WorkflowState::Succeeded);
    Ok(())
}

#[test]
fn test_join_barrier_converges_contexts() -> Result<()> {
    let spec = WorkflowSpec::new("template")
        .with_task(
            "task1",
            TaskSpec::new("core.echo")
                .with_next(on_success("task1", "task2"))
                .with_next(on_success("task1", "task3")),
        )
        .with_task(
            "task2",
            TaskSpec::new("core.echo").with_next(
                TransitionSpec::new()
                    .when("{{ succeeded('task2') }}")
                    .publish("left", json!("from task2"))
                    .then("join1"),
            ),
        )
        .with_task(
            "task3",
            TaskSpec::new("core.echo").with_next(
                TransitionSpec::new()
                    .when("{{ succeeded('task3') }}")
                    .publish("right", json!("from task3"))
                    .then("join1"),
            ),
        )
        .with_task("join1", TaskSpec::new("core.echo").with_join(Barrier::All));

    let mut conductor = start(spec)?;

    assert_eq!(names(&conductor.get_start_tasks()?), vec!["task1"]);
    assert_eq!(complete(&mut conductor, "task1")?, vec!["task2", "task3"]);

    // The join fires only after both inbound transitions are satisfied.
    assert!(complete(&mut conductor, "task2")?.is_empty());
    assert_eq!(complete(&mut conductor, "task3")?, vec!["join1"]);

    let join_descriptor = conductor.get_task("join1")?;
    assert_eq!(join_descriptor.ctx["left"], json!("from task2"));
    assert_eq!(join_descriptor.ctx["right"], json!("from task3"));

    assert!(complete(&mut conductor, "join1")?.is_empty());
    assert_eq!(conductor.get_workflow_state(), WorkflowState::Succeeded);

    // The converged context entry unions the predecessor flow indices.
    let flow = conductor.get_task_flow()?;
    let join_entry = flow.get_task_entry("join1").cloned().expect("join entry");
    let converged = &flow.contexts[join_entry.ctx];
    assert_eq!(converged.sources, vec![1, 2]);
    assert_eq!(converged.value["left"], json!("from task2"));
    assert_eq!(converged.value["right"], json!("from task3"));
    Ok(())
}

#[test]
fn test_barrier_one_merge_reactivates_completed_target() -> Result<()> {
    // Two independent branches feed a merge node whose barrier is one: the
    // first branch satisfies the barrier alone and runs the merge to
    // completion before the second branch's transition fires and stages
    // the same node again.
    let spec = WorkflowSpec::new("template")
        .with_task(
            "task1",
            TaskSpec::new("core.echo").with_next(on_success("task1", "merge1")),
        )
        .with_task(
            "task2",
            TaskSpec::new("core.echo").with_next(on_success("task2", "merge1")),
        )
        .with_task(
            "merge1",
            TaskSpec::new("core.echo").with_join(Barrier::Count(1)),
        );

    let mut conductor = start(spec)?;

    assert_eq!(names(&conductor.get_start_tasks()?), vec!["task1", "task2"]);
    assert_eq!(complete(&mut conductor, "task1")?, vec!["merge1"]);
    assert!(complete(&mut conductor, "merge1")?.is_empty());
    assert_eq!(conductor.get_workflow_state(), WorkflowState::Running);

    let flow = conductor.get_task_flow()?;
    assert_eq!(flow.sequence.len(), 2);
    let first_activation = flow.tasks["merge1"];
    assert_eq!(
        flow.sequence[first_activation].state,
        Some(TaskState::Succeeded)
    );

    // The second branch re-stages the already-completed merge.
    assert_eq!(complete(&mut conductor, "task2")?, vec!["merge1"]);

    // Driving it again appends a fresh activation and leaves the
    // completed entry untouched.
    conductor.update_task_flow("merge1", ExecutionEvent::started())?;
    let flow = conductor.get_task_flow()?;
    assert_eq!(flow.sequence.len(), 4);
    let second_activation = flow.tasks["merge1"];
    assert!(second_activation > first_activation);
    assert_eq!(
        flow.sequence[second_activation].state,
        Some(TaskState::Running)
    );
    assert_eq!(
        flow.sequence[first_activation].state,
        Some(TaskState::Succeeded)
    );

    conductor.update_task_flow("merge1", ExecutionEvent::succeeded(json!(null)))?;
    assert_eq!(conductor.get_workflow_state(), WorkflowState::Succeeded);
    Ok(())
}

#[test]
fn test_noop_completes_silently() -> Result<()> {
    let spec = WorkflowSpec::new("template").with_task(
        "task1",
        TaskSpec::new("core.echo").with_next(
            TransitionSpec::new()
                .when("{{ succeeded('task1') }}")
                .then("noop"),
        ),
    );

    let mut conductor = start(spec)?;

    assert_eq!(names(&conductor.get_start_tasks()?), vec!["task1"]);
    // The noop target is taken automatically and never handed out.
    assert!(complete(&mut conductor, "task1")?.is_empty());
    assert_eq!(conductor.get_workflow_state(), WorkflowState::Succeeded);

    let flow = conductor.get_task_flow()?;
    let noop_entry = flow.get_task_entry("noop").cloned().expect("noop entry");
    assert_eq!(noop_entry.state, Some(TaskState::Succeeded));
    Ok(())
}

#[test]
fn test_fail_task_aborts_workflow() -> Result<()> {
    let spec = WorkflowSpec::new("template")
        .with_task(
            "task1",
            TaskSpec::new("core.echo")
                .with_next(on_success("task1", "task2"))
                .with_next(
                    TransitionSpec::new()
                        .when("{{ failed('task1') }}")
                        .then("fail"),
                ),
        )
        .with_task("task2", TaskSpec::new("core.echo"));

    let mut conductor = start(spec)?;
    conductor.update_task_flow("task1", ExecutionEvent::started())?;
    conductor.update_task_flow("task1", ExecutionEvent::failed(json!({"stderr": "boom"})))?;

    assert_eq!(conductor.get_workflow_state(), WorkflowState::Failed);
    assert!(conductor.get_next_tasks(Some("task1"))?.is_empty());

    let flow = conductor.get_task_flow()?;
    let fail_entry = flow.get_task_entry("fail").cloned().expect("fail entry");
    assert_eq!(fail_entry.state, Some(TaskState::Failed));
    Ok(())
}

#[test]
fn test_criteria_evaluation_failure() -> Result<()> {
    let spec = WorkflowSpec::new("template")
        .with_task(
            "task1",
            TaskSpec::new("core.echo").with_next(
                TransitionSpec::new()
                    .when("{{ undefined_variable }}")
                    .then("task2"),
            ),
        )
        .with_task("task2", TaskSpec::new("core.echo"));

    let mut conductor = start(spec)?;
    conductor.update_task_flow("task1", ExecutionEvent::started())?;
    conductor.update_task_flow("task1", ExecutionEvent::succeeded(json!(null)))?;

    assert_eq!(conductor.get_workflow_state(), WorkflowState::Failed);
    assert!(conductor.get_next_tasks(Some("task1"))?.is_empty());

    let errors = conductor.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("undefined_variable"));
    assert_eq!(errors[0].task_id.as_deref(), Some("task1"));
    assert_eq!(errors[0].task_transition_id.as_deref(), Some("task2__0"));
    Ok(())
}

#[test]
fn test_failure_with_remediation_branch() -> Result<()> {
    let spec = WorkflowSpec::new("template")
        .with_task(
            "task1",
            TaskSpec::new("core.echo")
                .with_next(on_success("task1", "task2"))
                .with_next(
                    TransitionSpec::new()
                        .when("{{ failed('task1') }}")
                        .then("cleanup"),
                ),
        )
        .with_task("task2", TaskSpec::new("core.echo"))
        .with_task("cleanup", TaskSpec::new("core.echo"));

    let mut conductor = start(spec)?;
    conductor.update_task_flow("task1", ExecutionEvent::started())?;
    conductor.update_task_flow("task1", ExecutionEvent::failed(json!(null)))?;

    // The failure is handled; the workflow keeps running the cleanup branch.
    assert_eq!(conductor.get_workflow_state(), WorkflowState::Running);
    assert_eq!(names(&conductor.get_next_tasks(Some("task1"))?), vec!["cleanup"]);

    assert!(complete(&mut conductor, "cleanup")?.is_empty());
    assert_eq!(conductor.get_workflow_state(), WorkflowState::Succeeded);
    Ok(())
}

#[test]
fn test_publish_and_outputs() -> Result<()> {
    let spec = WorkflowSpec::new("template")
        .with_output("report", json!("{{ stage }}"))
        .with_task(
            "task1",
            TaskSpec::new("core.echo").with_next(
                TransitionSpec::new()
                    .when("{{ succeeded('task1') }}")
                    .publish("stage", json!("{{ result() }}"))
                    .then("task2"),
            ),
        )
        .with_task("task2", TaskSpec::new("core.echo"));

    let mut conductor = start(spec)?;
    conductor.get_start_tasks()?;
    conductor.update_task_flow("task1", ExecutionEvent::started())?;
    conductor.update_task_flow("task1", ExecutionEvent::succeeded(json!("one done")))?;

    // The published value rides the outgoing context into task2.
    let task2 = conductor.get_task("task2")?;
    assert_eq!(task2.ctx["stage"], json!("one done"));

    conductor.update_task_flow("task2", ExecutionEvent::started())?;
    conductor.update_task_flow("task2", ExecutionEvent::succeeded(json!(null)))?;

    assert_eq!(conductor.get_workflow_state(), WorkflowState::Succeeded);
    let terminal = conductor.get_workflow_terminal_context()?;
    assert_eq!(terminal.value["stage"], json!("one done"));
    assert!(terminal.term);

    let output = conductor.get_workflow_output().expect("rendered outputs");
    assert_eq!(output["report"], json!("one done"));
    Ok(())
}

#[test]
fn test_inputs_and_vars_seed_initial_context() -> Result<()> {
    let spec = WorkflowSpec::new("template")
        .with_input("name", true, None)
        .with_input("retries", false, Some(json!(3)))
        .with_var("greeting", json!("hello {{ name }}"))
        .with_task(
            "task1",
            TaskSpec::new("core.echo").with_input("message", json!("{{ greeting }}")),
        );

    let mut inputs = serde_json::Map::new();
    inputs.insert("name".to_string(), json!("alpha"));

    init_logging();
    let mut conductor = WorkflowConductor::new(spec, None, Some(inputs))?;
    conductor.request_workflow_state(WorkflowState::Running)?;

    let start_tasks = conductor.get_start_tasks()?;
    assert_eq!(start_tasks.len(), 1);
    assert_eq!(start_tasks[0].spec.input["message"], json!("hello alpha"));

    let initial = conductor.get_workflow_initial_context()?;
    assert_eq!(initial.value["retries"], json!(3));
    assert_eq!(initial.value["greeting"], json!("hello alpha"));
    Ok(())
}

#[test]
fn test_missing_required_input_fails_workflow() -> Result<()> {
    let spec = WorkflowSpec::new("template")
        .with_input("name", true, None)
        .with_task("task1", TaskSpec::new("core.echo"));

    init_logging();
    let mut conductor = WorkflowConductor::new(spec, None, None)?;
    conductor.request_workflow_state(WorkflowState::Running)?;

    assert!(conductor.get_start_tasks()?.is_empty());
    assert_eq!(conductor.get_workflow_state(), WorkflowState::Failed);
    assert!(!conductor.errors().is_empty());
    Ok(())
}

#[test]
fn test_cycle_reentry_appends_activations() -> Result<()> {
    let spec = WorkflowSpec::new("template")
        .with_task(
            "task1",
            TaskSpec::new("core.echo").with_next(on_success("task1", "task2")),
        )
        .with_task(
            "task2",
            TaskSpec::new("core.echo").with_next(
                TransitionSpec::new()
                    .when("{{ failed('task2') }}")
                    .then("task1"),
            ),
        );

    let mut conductor = start(spec)?;

    assert_eq!(names(&conductor.get_start_tasks()?), vec!["task1"]);
    assert_eq!(complete(&mut conductor, "task1")?, vec!["task2"]);

    // task2 fails; its retry edge re-enters the cycle through task1.
    conductor.update_task_flow("task2", ExecutionEvent::started())?;
    conductor.update_task_flow("task2", ExecutionEvent::failed(json!(null)))?;
    assert_eq!(conductor.get_workflow_state(), WorkflowState::Running);
    assert_eq!(names(&conductor.get_next_tasks(Some("task2"))?), vec!["task1"]);

    assert_eq!(complete(&mut conductor, "task1")?, vec!["task2"]);
    assert!(complete(&mut conductor, "task2")?.is_empty());
    assert_eq!(conductor.get_workflow_state(), WorkflowState::Succeeded);

    let flow = conductor.get_task_flow()?;
    assert_eq!(flow.sequence.len(), 4);
    assert_eq!(flow.tasks["task1"], 2);
    assert_eq!(flow.tasks["task2"], 3);
    Ok(())
}

#[test]
fn test_pause_and_resume() -> Result<()> {
    let spec = WorkflowSpec::new("template").with_task("task1", TaskSpec::new("core.echo"));

    let mut conductor = start(spec)?;
    conductor.get_start_tasks()?;
    conductor.update_task_flow("task1", ExecutionEvent::started())?;
    conductor.update_task_flow(
        "task1",
        ExecutionEvent::new(ExecutionEventKind::ActionPaused),
    )?;

    assert_eq!(conductor.get_workflow_state(), WorkflowState::Paused);
    assert!(conductor.get_next_tasks(None)?.is_empty());

    conductor.request_workflow_state(WorkflowState::Resuming)?;
    conductor.update_task_flow("task1", ExecutionEvent::started())?;
    assert_eq!(conductor.get_workflow_state(), WorkflowState::Running);

    conductor.update_task_flow("task1", ExecutionEvent::succeeded(json!(null)))?;
    assert_eq!(conductor.get_workflow_state(), WorkflowState::Succeeded);
    Ok(())
}

#[test]
fn test_cancelation() -> Result<()> {
    let mut conductor = start(sequential_spec())?;
    conductor.get_start_tasks()?;
    conductor.update_task_flow("task1", ExecutionEvent::started())?;
    conductor.update_task_flow("task1", ExecutionEvent::canceled())?;

    assert_eq!(conductor.get_workflow_state(), WorkflowState::Canceled);
    assert!(conductor.get_next_tasks(Some("task1"))?.is_empty());
    Ok(())
}

#[test]
fn test_staging_monotonicity() -> Result<()> {
    let mut conductor = start(sequential_spec())?;
    conductor.get_start_tasks()?;
    assert!(complete(&mut conductor, "task1")?.contains(&"task2".to_string()));

    // task2 is staged exactly once until it is driven.
    let flow = conductor.get_task_flow()?;
    assert!(flow.staged.contains_key("task2"));
    assert!(flow.get_task_entry("task2").is_none());

    conductor.update_task_flow("task2", ExecutionEvent::started())?;
    let flow = conductor.get_task_flow()?;
    assert!(!flow.staged.contains_key("task2"));
    assert!(flow.get_task_entry("task2").is_some());
    Ok(())
}

#[test]
fn test_unknown_catalog_is_rejected() -> Result<()> {
    let spec = WorkflowSpec::new("nosuch").with_task("task1", TaskSpec::new("core.echo"));

    init_logging();
    let mut conductor = WorkflowConductor::new(spec, None, None)?;
    conductor.request_workflow_state(WorkflowState::Running)?;

    assert!(matches!(
        conductor.get_start_tasks(),
        Err(ConductorError::UnknownComposer(_))
    ));
    Ok(())
}
