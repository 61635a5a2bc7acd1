#![allow(dead_code)]

use cymphony::store::rows;
use cymphony::store::RunNamespace;
use cymphony::workflow::{RunStatus, RunType};
use cymphony::{Config, Cymphony, NewWorkflow, Run, RunOptions, WorkflowArtifacts};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

pub const INSTRUCTIONS: &str = "<p>Is this message spam?</p>";

pub const THREE_ROWS: &str = "_id,text\n1,win a prize\n2,lunch at noon?\n3,cheap pills\n";

pub const ONE_ROW: &str = "_id,text\n1,win a prize\n";

pub struct Harness {
    pub dir: TempDir,
    pub cymphony: Cymphony,
}

impl Harness {
    pub async fn open() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_data_dir(dir.path());
        Self::open_with(dir, config).await
    }

    pub async fn open_with(dir: TempDir, config: Config) -> Self {
        let cymphony = Cymphony::open_with_provider(config, None).await.unwrap();
        Self { dir, cymphony }
    }

    pub async fn workflow(&self, program: &str, data: &str) -> i64 {
        self.cymphony.create_workflow(&workflow(program, data)).await.unwrap()
    }

    /// Create a workflow and start a run of it.
    pub async fn start(&self, program: &str, data: &str, run_type: RunType) -> (i64, i64) {
        let workflow_id = self.workflow(program, data).await;
        let options = RunOptions {
            run_type,
            ..RunOptions::default()
        };
        let run_id = self.cymphony.create_run(workflow_id, &options).await.unwrap();
        (workflow_id, run_id)
    }

    /// The single running human job of a run.
    pub async fn human_job(&self, run_id: i64) -> i64 {
        let jobs = self.cymphony.running_jobs(run_id).await.unwrap();
        assert_eq!(jobs.len(), 1, "expected one running job, got {:?}", jobs);
        jobs[0].id
    }

    pub async fn namespace(&self, run_id: i64) -> RunNamespace {
        let run = self.cymphony.run_status(run_id).await.unwrap();
        RunNamespace::new(run.user_id, run.project_id, run.workflow_id, run.id)
    }

    pub async fn table_count(&self, run_id: i64, variable: &str) -> i64 {
        let table = self.namespace(run_id).await.table(variable);
        let mut conn = self.cymphony.database().connection().await.unwrap();
        rows::count(&mut conn, &table).await.unwrap()
    }

    pub async fn table_rows(&self, run_id: i64, variable: &str) -> (Vec<String>, Vec<Vec<Option<String>>>) {
        let table = self.namespace(run_id).await.table(variable);
        let mut conn = self.cymphony.database().connection().await.unwrap();
        rows::fetch_text(&mut conn, &table).await.unwrap()
    }

    pub async fn output_file(&self, run_id: i64, name: &str) -> PathBuf {
        self.namespace(run_id)
            .await
            .run_dir(self.dir.path())
            .join("outputs")
            .join(name)
    }

    pub async fn wait_for(&self, run_id: i64, status: RunStatus) -> Run {
        for _ in 0..200 {
            let run = self.cymphony.run_status(run_id).await.unwrap();
            if run.status == status {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("run {} never reached {}", run_id, status);
    }
}

pub fn workflow(program: &str, data: &str) -> NewWorkflow {
    let mut artifacts = WorkflowArtifacts {
        program: program.to_string(),
        ..WorkflowArtifacts::default()
    };
    artifacts.files.insert("data.csv".into(), data.to_string());
    artifacts.files.insert("inst.html".into(), INSTRUCTIONS.to_string());
    NewWorkflow {
        project_id: 3,
        user_id: 7,
        name: "spam filter".to_string(),
        description: String::new(),
        artifacts,
    }
}

/// `read_table` then one `label` with the given parameters.
pub fn label_program(params: &str) -> String {
    format!(
        "A = read_table('data.csv');
         L = label(A, 'inst.html', labels=[Yes, No], {});",
        params
    )
}

/// Data rows of a CSV file, header excluded.
pub fn csv_rows(path: &std::path::Path) -> usize {
    let text = std::fs::read_to_string(path).unwrap();
    text.lines().skip(1).filter(|l| !l.is_empty()).count()
}
