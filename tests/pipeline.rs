mod common;

use common::{csv_rows, Harness, THREE_ROWS};
use cymphony::workflow::{RunStatus, RunType};
use cymphony::{AssignOutcome, Config, WorkerContext};

const PROGRAM: &str = "A = read_table('data.csv');
     L = label(A, 'inst.html', labels=[Yes, No], k=1, n=1);
     S = exec_sql(\"SELECT _id, text FROM L WHERE label = 'Yes'\", L);
     write_table(S, 'spam.csv');";

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::for_data_dir(dir.path());
    // streamed by hand
    config.pipeline.interval_secs = 3600;
    Harness::open_with(dir, config).await
}

#[tokio::test]
async fn partial_labels_flow_downstream_before_the_job_closes() {
    let h = harness().await;
    let (_, run_id) = h.start(PROGRAM, THREE_ROWS, RunType::PipelinedSimulated).await;
    let job = h.human_job(run_id).await;
    let worker = WorkerContext::regular(1);
    let c = &h.cymphony;
    let controller = c.controller();

    assert_eq!(c.assign_task(&worker, job).await.unwrap(), AssignOutcome::Assigned { task_id: 1 });
    let first = c.submit_annotation(&worker, job, 1, "Yes").await.unwrap();
    assert_eq!(first.next, AssignOutcome::Assigned { task_id: 2 });

    let tick = controller.stream_once(job).await.unwrap();
    assert_eq!((tick.new_rows, tick.operators, tick.closed), (1, 2, false));
    assert_eq!(h.table_count(run_id, "L").await, 1);
    assert_eq!(h.table_count(run_id, "S").await, 1);
    assert_eq!(csv_rows(&h.output_file(run_id, "spam.csv").await), 1);

    // nothing new
    let idle = controller.stream_once(job).await.unwrap();
    assert_eq!((idle.new_rows, idle.operators), (0, 0));

    c.submit_annotation(&worker, job, 2, "No").await.unwrap();
    let last = c.submit_annotation(&worker, job, 3, "Yes").await.unwrap();
    assert_eq!(last.finalized.as_deref(), Some("Yes"));
    // pipelined jobs are completed by their streaming loop, not by the vote
    assert_eq!(c.run_status(run_id).await.unwrap().status, RunStatus::Running);

    let tick = controller.stream_once(job).await.unwrap();
    assert_eq!(tick.new_rows, 2);
    assert!(tick.closed);
    assert_eq!(h.table_count(run_id, "S").await, 2);
    assert_eq!(csv_rows(&h.output_file(run_id, "spam.csv").await), 2);

    assert!(controller.complete_job(job).await.unwrap());
    assert_eq!(c.run_status(run_id).await.unwrap().status, RunStatus::Completed);
    // recomputed over the full table
    assert_eq!(h.table_count(run_id, "L").await, 3);
    assert_eq!(h.table_count(run_id, "S").await, 2);
    assert_eq!(csv_rows(&h.output_file(run_id, "spam.csv").await), 2);
}

#[tokio::test]
async fn the_streaming_loop_completes_the_job() {
    let h = Harness::open().await;
    let (_, run_id) = h.start(PROGRAM, THREE_ROWS, RunType::PipelinedSimulated).await;
    let job = h.human_job(run_id).await;
    let worker = WorkerContext::regular(1);
    let c = &h.cymphony;
    assert_eq!(c.controller().supervisor().active(job), 1);

    let mut next = c.assign_task(&worker, job).await.unwrap();
    while let AssignOutcome::Assigned { task_id } = next {
        next = c.submit_annotation(&worker, job, task_id, "Yes").await.unwrap().next;
    }

    h.wait_for(run_id, RunStatus::Completed).await;
    assert_eq!(h.table_count(run_id, "S").await, 3);
    assert_eq!(c.controller().supervisor().active(job), 0);
}
