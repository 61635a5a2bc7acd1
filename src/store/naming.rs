/// Deterministic table and directory names
///
/// Every run owns the `u{user}_p{project}_w{workflow}_r{run}_` namespace and every
/// job inside it owns `..._j{job}_`, so no two runs or jobs ever share a table.

use std::path::{Path, PathBuf};

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunNamespace {
    prefix: String,
}

impl RunNamespace {
    pub fn new(user_id: i64, project_id: i64, workflow_id: i64, run_id: i64) -> Self {
        Self {
            prefix: format!("u{}_p{}_w{}_r{}_", user_id, project_id, workflow_id, run_id),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Run-scoped table bound to a DSL variable.
    pub fn table(&self, variable: &str) -> String {
        format!("{}{}", self.prefix, variable)
    }

    /// Temporary per-tick delta table used by pipelined streaming.
    pub fn delta_table(&self, variable: &str) -> String {
        format!("{}_delta_{}", self.prefix, variable)
    }

    pub fn run_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join("runs").join(&self.prefix)
    }

    pub fn job(&self, job_id: i64) -> JobNamespace {
        JobNamespace {
            prefix: format!("{}j{}_", self.prefix, job_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNamespace {
    prefix: String,
}

impl JobNamespace {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn local(&self) -> JobTables {
        self.tables("")
    }

    pub fn provider(&self) -> JobTables {
        self.tables("amt_")
    }

    fn tables(&self, set: &str) -> JobTables {
        let name = |suffix: &str| format!("{}{}{}", self.prefix, set, suffix);
        JobTables {
            tuples: name("tuples"),
            tasks: name("tasks"),
            assignments: name("assignments"),
            outputs: name("outputs"),
            final_labels: name("final_labels"),
            hits: name("hits"),
            index_prefix: name("idx_"),
        }
    }
}

/// Table names of one job, unquoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTables {
    pub tuples: String,
    pub tasks: String,
    pub assignments: String,
    pub outputs: String,
    pub final_labels: String,
    /// Only used by the provider set.
    pub hits: String,
    pub index_prefix: String,
}

impl JobTables {
    pub fn index(&self, name: &str) -> String {
        format!("{}{}", self.index_prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_the_namespace() {
        let run = RunNamespace::new(7, 3, 11, 42);
        assert_eq!(run.prefix(), "u7_p3_w11_r42_");
        assert_eq!(run.table("A"), "u7_p3_w11_r42_A");
        let job = run.job(5);
        assert_eq!(job.local().final_labels, "u7_p3_w11_r42_j5_final_labels");
        assert_eq!(job.provider().tasks, "u7_p3_w11_r42_j5_amt_tasks");
        assert_eq!(job.provider().hits, "u7_p3_w11_r42_j5_amt_hits");
        assert_eq!(
            run.run_dir(Path::new("/data")),
            PathBuf::from("/data/runs/u7_p3_w11_r42_")
        );
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
