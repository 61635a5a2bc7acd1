mod common;

use common::{label_program, Harness, ONE_ROW, THREE_ROWS};
use cymphony::workflow::{RunStatus, RunType, WorkerKind};
use cymphony::{AssignOutcome, DriveByVote, WorkerContext};

fn regular(id: i64) -> WorkerContext {
    WorkerContext::regular(id)
}

#[tokio::test]
async fn two_of_two_agreeing_votes_commit_the_label() {
    let h = Harness::open().await;
    let (_, run_id) = h.start(&label_program("k=2, n=2"), ONE_ROW, RunType::Human).await;
    let job = h.human_job(run_id).await;
    let c = &h.cymphony;

    assert_eq!(c.assign_task(&regular(1), job).await.unwrap(), AssignOutcome::Assigned { task_id: 1 });
    assert_eq!(c.assign_task(&regular(2), job).await.unwrap(), AssignOutcome::Assigned { task_id: 1 });

    let first = c.submit_annotation(&regular(1), job, 1, "Yes").await.unwrap();
    assert!(first.recorded);
    assert_eq!(first.finalized, None);
    assert_eq!(first.next, AssignOutcome::NoTaskAvailable);

    let second = c.submit_annotation(&regular(2), job, 1, "Yes").await.unwrap();
    assert_eq!(second.finalized.as_deref(), Some("Yes"));
    assert_eq!(second.next, AssignOutcome::JobClosed);

    assert_eq!(c.final_labels(job).await.unwrap(), vec![(1, "Yes".to_string())]);
    h.wait_for(run_id, RunStatus::Completed).await;
    let (headers, rows) = h.table_rows(run_id, "L").await;
    assert_eq!(headers, vec!["_id", "text", "label"]);
    assert_eq!(rows[0][2].as_deref(), Some("Yes"));
}

#[tokio::test]
async fn split_votes_exhaust_the_budget_as_undecided() {
    let h = Harness::open().await;
    let (_, run_id) = h.start(&label_program("k=2, n=2"), ONE_ROW, RunType::Human).await;
    let job = h.human_job(run_id).await;
    let c = &h.cymphony;

    c.assign_task(&regular(1), job).await.unwrap();
    c.assign_task(&regular(2), job).await.unwrap();
    c.submit_annotation(&regular(1), job, 1, "Yes").await.unwrap();
    let last = c.submit_annotation(&regular(2), job, 1, "No").await.unwrap();
    assert_eq!(last.finalized.as_deref(), Some("undecided"));
    h.wait_for(run_id, RunStatus::Completed).await;
}

#[tokio::test]
async fn early_agreement_stops_assignment() {
    let h = Harness::open().await;
    let (_, run_id) = h.start(&label_program("k=2, n=5"), ONE_ROW, RunType::Human).await;
    let job = h.human_job(run_id).await;
    let c = &h.cymphony;

    c.assign_task(&regular(1), job).await.unwrap();
    c.assign_task(&regular(2), job).await.unwrap();
    // k live assignments close the task to further workers
    assert_eq!(c.assign_task(&regular(3), job).await.unwrap(), AssignOutcome::NoTaskAvailable);

    c.submit_annotation(&regular(1), job, 1, "Yes").await.unwrap();
    let done = c.submit_annotation(&regular(2), job, 1, "Yes").await.unwrap();
    assert_eq!(done.finalized.as_deref(), Some("Yes"));

    let snapshot = c.task_snapshot(job, 1).await.unwrap().unwrap();
    assert_eq!(snapshot.total_assigned, 2);
    assert_eq!(snapshot.label.as_deref(), Some("Yes"));
}

#[tokio::test]
async fn disagreement_reopens_the_task_for_a_tie_breaker() {
    let h = Harness::open().await;
    let (_, run_id) = h.start(&label_program("k=2, n=3"), ONE_ROW, RunType::Human).await;
    let job = h.human_job(run_id).await;
    let c = &h.cymphony;

    c.assign_task(&regular(1), job).await.unwrap();
    c.assign_task(&regular(2), job).await.unwrap();
    c.submit_annotation(&regular(1), job, 1, "Yes").await.unwrap();
    let second = c.submit_annotation(&regular(2), job, 1, "No").await.unwrap();
    assert_eq!(second.finalized, None);

    let snapshot = c.task_snapshot(job, 1).await.unwrap().unwrap();
    assert!(!snapshot.done);
    assert_eq!(snapshot.pending_annotations, 0);

    assert_eq!(c.assign_task(&regular(3), job).await.unwrap(), AssignOutcome::Assigned { task_id: 1 });
    let third = c.submit_annotation(&regular(3), job, 1, "Yes").await.unwrap();
    assert_eq!(third.finalized.as_deref(), Some("Yes"));
    h.wait_for(run_id, RunStatus::Completed).await;
}

#[tokio::test]
async fn labels_outside_the_set_are_rejected() {
    let h = Harness::open().await;
    let (_, run_id) = h.start(&label_program("k=1, n=1"), ONE_ROW, RunType::Human).await;
    let job = h.human_job(run_id).await;
    let c = &h.cymphony;

    c.assign_task(&regular(1), job).await.unwrap();
    let err = c.submit_annotation(&regular(1), job, 1, "Maybe").await.unwrap_err();
    assert!(matches!(err, cymphony::CymphonyError::InvalidAnnotation { .. }));
    let snapshot = c.task_snapshot(job, 1).await.unwrap().unwrap();
    assert_eq!(snapshot.pending_annotations, 1);
}

#[tokio::test]
async fn workers_walk_every_task_in_order() {
    let h = Harness::open().await;
    let (_, run_id) = h.start(&label_program("k=1, n=1"), THREE_ROWS, RunType::Human).await;
    let job = h.human_job(run_id).await;
    let c = &h.cymphony;

    let mut next = c.assign_task(&regular(1), job).await.unwrap();
    let mut labeled = Vec::new();
    while let AssignOutcome::Assigned { task_id } = next {
        labeled.push(task_id);
        next = c.submit_annotation(&regular(1), job, task_id, "No").await.unwrap().next;
    }
    assert_eq!(labeled, vec![1, 2, 3]);
    assert_eq!(next, AssignOutcome::JobClosed);
    h.wait_for(run_id, RunStatus::Completed).await;
    assert_eq!(h.table_count(run_id, "L").await, 3);
}

#[tokio::test]
async fn skip_hands_the_task_back() {
    let h = Harness::open().await;
    let (_, run_id) = h.start(&label_program("k=1, n=1"), ONE_ROW, RunType::Human).await;
    let job = h.human_job(run_id).await;
    let c = &h.cymphony;

    c.assign_task(&regular(1), job).await.unwrap();
    assert_eq!(c.assign_task(&regular(2), job).await.unwrap(), AssignOutcome::NoTaskAvailable);
    assert!(c.skip(&regular(1), job, 1).await.unwrap());
    assert!(!c.skip(&regular(1), job, 1).await.unwrap());

    let snapshot = c.task_snapshot(job, 1).await.unwrap().unwrap();
    assert_eq!((snapshot.abandoned, snapshot.pending_annotations, snapshot.done), (1, 0, false));
    assert_eq!(c.assign_task(&regular(2), job).await.unwrap(), AssignOutcome::Assigned { task_id: 1 });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_assignment_hands_out_the_last_task_once() {
    let h = Harness::open().await;
    let (_, run_id) = h.start(&label_program("k=1, n=1"), ONE_ROW, RunType::Human).await;
    let job = h.human_job(run_id).await;
    let c = &h.cymphony;

    let (w1, w2) = (regular(1), regular(2));
    let (a, b) = tokio::join!(c.assign_task(&w1, job), c.assign_task(&w2, job));
    let outcomes = [a.unwrap(), b.unwrap()];
    let assigned = outcomes
        .iter()
        .filter(|o| matches!(o, AssignOutcome::Assigned { .. }))
        .count();
    assert_eq!(assigned, 1, "{:?}", outcomes);
    assert!(outcomes.contains(&AssignOutcome::NoTaskAvailable));

    let snapshot = c.task_snapshot(job, 1).await.unwrap().unwrap();
    assert_eq!(snapshot.total_assigned, 1);
}

#[tokio::test]
async fn monitor_reclaims_timed_out_assignments() {
    let h = Harness::open().await;
    let (_, run_id) = h.start(&label_program("k=1, n=1, timeout=60"), ONE_ROW, RunType::Human).await;
    let job = h.human_job(run_id).await;
    let c = &h.cymphony;

    c.assign_task(&regular(1), job).await.unwrap();
    let now = cymphony::workflow::types::now_millis();
    assert_eq!(c.sweep_at(now).await.unwrap(), 0);
    assert_eq!(c.sweep_at(now + 61_000).await.unwrap(), 1);

    let snapshot = c.task_snapshot(job, 1).await.unwrap().unwrap();
    assert_eq!(snapshot.total_assigned, 1);
    assert_eq!(snapshot.abandoned, 1);
    assert_eq!(snapshot.pending_annotations, 0);
    assert!(!snapshot.done);

    // the late vote is dropped and the worker is offered the task again
    let late = c.submit_annotation(&regular(1), job, 1, "Yes").await.unwrap();
    assert!(!late.recorded);
    assert_eq!(late.next, AssignOutcome::Assigned { task_id: 1 });
}

#[tokio::test]
async fn one_broken_job_does_not_stop_the_sweep() {
    let h = Harness::open().await;
    let program = label_program("k=1, n=1, timeout=60");
    let (_, broken_run) = h.start(&program, ONE_ROW, RunType::Human).await;
    let (_, healthy_run) = h.start(&program, ONE_ROW, RunType::Human).await;
    let broken = h.human_job(broken_run).await;
    let healthy = h.human_job(healthy_run).await;
    let c = &h.cymphony;

    c.assign_task(&regular(1), broken).await.unwrap();
    c.assign_task(&regular(1), healthy).await.unwrap();

    let assignments = h.namespace(broken_run).await.job(broken).local().assignments;
    sqlx::query(&format!("DROP TABLE \"{}\"", assignments))
        .execute(c.database().pool())
        .await
        .unwrap();

    let now = cymphony::workflow::types::now_millis();
    assert_eq!(c.sweep_at(now + 61_000).await.unwrap(), 1);
    assert_eq!(c.task_snapshot(healthy, 1).await.unwrap().unwrap().abandoned, 1);
}

#[tokio::test]
async fn drive_by_votes_count_towards_consensus() {
    let h = Harness::open().await;
    let (_, run_id) = h.start(&label_program("k=2, n=3"), THREE_ROWS, RunType::Human).await;
    let job = h.human_job(run_id).await;
    let c = &h.cymphony;

    c.assign_task(&regular(1), job).await.unwrap();
    c.submit_annotation(&regular(1), job, 1, "Yes").await.unwrap();

    let vote = |external_id, worker_id, annotation: &str| DriveByVote {
        external_id,
        worker_id,
        annotation: annotation.to_string(),
    };
    let accepted = c
        .drive_by_curate(
            run_id,
            &[
                vote(1, 50, "Yes"),
                vote(2, 50, "No"),
                vote(2, 51, "No"),
                vote(3, 50, "Perhaps"),
                vote(99, 50, "Yes"),
            ],
        )
        .await
        .unwrap();
    assert_eq!(accepted, 3);
    assert_eq!(
        c.final_labels(job).await.unwrap(),
        vec![(1, "Yes".to_string()), (2, "No".to_string())]
    );
    assert_eq!(h.cymphony.run_status(run_id).await.unwrap().status, RunStatus::Running);

    c.drive_by_curate(run_id, &[vote(3, 50, "Yes"), vote(3, 51, "Yes")]).await.unwrap();
    h.wait_for(run_id, RunStatus::Completed).await;
}

#[tokio::test]
async fn drive_by_needs_a_running_human_job() {
    let h = Harness::open().await;
    let (_, run_id) = h
        .start("A = read_table('data.csv'); write_table(A, 'copy.csv');", ONE_ROW, RunType::Human)
        .await;
    let err = h.cymphony.drive_by_curate(run_id, &[]).await.unwrap_err();
    assert!(matches!(err, cymphony::CymphonyError::Configuration(_)));
}

#[tokio::test]
async fn stewards_use_their_own_thresholds() {
    let h = Harness::open().await;
    let (_, run_id) = h.start(&label_program("k=2, n=2, l=1, m=1"), ONE_ROW, RunType::Human).await;
    let job = h.human_job(run_id).await;
    let c = &h.cymphony;
    c.register_worker(100, WorkerKind::Steward).await.unwrap();
    let steward = c.worker_context(100).await.unwrap();
    assert!(steward.is_steward());

    assert_eq!(c.assign_task(&steward, job).await.unwrap(), AssignOutcome::Assigned { task_id: 1 });
    let vote = c.submit_annotation(&steward, job, 1, "No").await.unwrap();
    assert_eq!(vote.finalized.as_deref(), Some("No"));
    h.wait_for(run_id, RunStatus::Completed).await;
}

/// Steward and regular bookkeeping share the task's `done` flag. A steward
/// giving back an assignment recomputes `done` from steward assignments
/// alone and reopens a task the regular protocol had filled.
#[tokio::test]
async fn steward_abandonment_reopens_a_task_filled_by_regular_workers() {
    let h = Harness::open().await;
    let (_, run_id) = h.start(&label_program("k=1, n=1, l=2, m=2"), ONE_ROW, RunType::Human).await;
    let job = h.human_job(run_id).await;
    let c = &h.cymphony;
    c.register_worker(100, WorkerKind::Steward).await.unwrap();
    let steward = c.worker_context(100).await.unwrap();

    assert_eq!(c.assign_task(&steward, job).await.unwrap(), AssignOutcome::Assigned { task_id: 1 });
    assert!(!c.task_snapshot(job, 1).await.unwrap().unwrap().done);

    assert_eq!(c.assign_task(&regular(1), job).await.unwrap(), AssignOutcome::Assigned { task_id: 1 });
    assert!(c.task_snapshot(job, 1).await.unwrap().unwrap().done);
    assert_eq!(c.assign_task(&regular(2), job).await.unwrap(), AssignOutcome::NoTaskAvailable);

    assert!(c.skip(&steward, job, 1).await.unwrap());
    let snapshot = c.task_snapshot(job, 1).await.unwrap().unwrap();
    assert!(!snapshot.done, "steward give-back reopened the task");

    // a second regular worker now gets a task whose k-of-n budget is already in use
    assert_eq!(c.assign_task(&regular(2), job).await.unwrap(), AssignOutcome::Assigned { task_id: 1 });
    assert_eq!(c.task_snapshot(job, 1).await.unwrap().unwrap().total_assigned, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn the_scheduled_monitor_sweeps_on_its_own() {
    let h = Harness::open().await;
    let (_, run_id) = h.start(&label_program("k=1, n=1, timeout=1"), ONE_ROW, RunType::Human).await;
    let job = h.human_job(run_id).await;
    let c = &h.cymphony;
    c.assign_task(&regular(1), job).await.unwrap();

    c.monitor().start(std::time::Duration::from_secs(1)).await.unwrap();
    let mut abandoned = 0;
    for _ in 0..100 {
        abandoned = c.task_snapshot(job, 1).await.unwrap().unwrap().abandoned;
        if abandoned > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    c.monitor().stop().await.unwrap();
    assert_eq!(abandoned, 1);
}
