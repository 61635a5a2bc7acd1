/// Lock-free cache of compiled run programs using ArcSwap
///
/// Every in-flight run needs its compiled graph to resume. Reads are a single
/// atomic load; inserts and evictions clone the map and swap the pointer. A miss
/// reloads the program from the persisted `nodes`/`edges`/`schedule` rows, so a
/// restarted process resumes runs without recompiling.

use crate::compiler::Program;
use crate::error::Result;
use crate::workflow::storage::WorkflowStorage;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

#[derive(Debug)]
pub struct RunRegistry {
    /// Key: run_id
    programs: ArcSwap<HashMap<i64, Arc<Program>>>,
    storage: WorkflowStorage,
}

impl RunRegistry {
    pub fn new(storage: WorkflowStorage) -> Self {
        Self {
            programs: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    pub fn get(&self, run_id: i64) -> Option<Arc<Program>> {
        self.programs.load().get(&run_id).cloned()
    }

    pub fn insert(&self, run_id: i64, program: Arc<Program>) {
        self.programs.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(run_id, Arc::clone(&program));
            next
        });
        tracing::debug!("Cached compiled program for run {}", run_id);
    }

    /// Cached program, or reload it from storage.
    pub async fn program(&self, run_id: i64) -> Result<Arc<Program>> {
        if let Some(program) = self.get(run_id) {
            return Ok(program);
        }
        let program = Arc::new(self.storage.load_program(run_id).await?);
        self.insert(run_id, Arc::clone(&program));
        tracing::info!("Reloaded compiled program for run {} from storage", run_id);
        Ok(program)
    }

    pub fn evict(&self, run_id: i64) {
        let mut removed = false;
        self.programs.rcu(|current| {
            let mut next = (**current).clone();
            removed = next.remove(&run_id).is_some();
            next
        });
        if removed {
            tracing::debug!("Evicted compiled program for run {}", run_id);
        }
    }

    pub fn len(&self) -> usize {
        self.programs.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CompileLimits, Uploads};
    use crate::config::Config;
    use crate::store::database::Database;
    use crate::workflow::types::{NewWorkflow, RunOptions, WorkflowArtifacts};

    #[tokio::test]
    async fn miss_reloads_the_persisted_program() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&Config::for_data_dir(dir.path()).database)
            .await
            .unwrap();
        let storage = WorkflowStorage::new(db.pool().clone());

        let mut files = Uploads::new();
        files.insert("d.csv".into(), "_id,x\n1,a\n".into());
        let source = "A = read_table('d.csv'); B = sample_random(A, size=1); write_table(B, 'b.csv');";
        let workflow_id = storage
            .create_workflow(&NewWorkflow {
                project_id: 1,
                user_id: 1,
                name: "wf".into(),
                description: String::new(),
                artifacts: WorkflowArtifacts {
                    program: source.into(),
                    files: files.clone(),
                },
            })
            .await
            .unwrap();
        let workflow = storage.get_workflow(workflow_id).await.unwrap().unwrap();
        let program = compile(source, &files, &CompileLimits::default()).unwrap();

        let mut tx = db.lock().await.unwrap();
        let run = storage
            .insert_run(tx.conn(), &workflow, &RunOptions::default(), &program)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let registry = RunRegistry::new(storage);
        assert!(registry.get(run.id).is_none());
        let loaded = registry.program(run.id).await.unwrap();
        assert_eq!(loaded.schedule, program.schedule);
        assert_eq!(loaded.graph.edges().count(), program.graph.edges().count());
        assert_eq!(registry.len(), 1);
        registry.evict(run.id);
        assert!(registry.is_empty());
    }
}
