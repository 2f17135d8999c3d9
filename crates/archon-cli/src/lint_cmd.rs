//! `archon lint`: validate a plan without executing it.

use std::path::Path;

use anyhow::Result;
use serde_json::json;

use archon_core::plan::{Dag, Plan};

/// Output format for lint results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LintFormat {
    Text,
    Json,
}

/// Validate a plan file. Returns the process exit code (0 valid,
/// 1 invalid).
pub fn lint_plan(plan_path: &Path, format: LintFormat) -> Result<u8> {
    let result = Plan::load(plan_path).and_then(|plan| {
        let dag = Dag::build(&plan)?;
        Ok((plan, dag))
    });

    match result {
        Ok((plan, dag)) => {
            match format {
                LintFormat::Text => {
                    println!(
                        "{}: valid ({} tasks, {} layers, critical path {})",
                        plan.plan_id,
                        plan.tasks.len(),
                        dag.depth(),
                        dag.critical_path().join(" -> ")
                    );
                }
                LintFormat::Json => {
                    let report = json!({
                        "valid": true,
                        "plan_id": plan.plan_id,
                        "version": plan.version,
                        "task_count": plan.tasks.len(),
                        "layers": dag.depth(),
                        "critical_path": dag.critical_path(),
                        "parallelizable_tasks": dag.parallelizable_tasks(),
                    });
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
            }
            Ok(0)
        }
        Err(e) => {
            match format {
                LintFormat::Text => eprintln!("invalid plan: {e}"),
                LintFormat::Json => {
                    let report = json!({
                        "valid": false,
                        "error": e.to_string(),
                    });
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
            }
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_plan(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn valid_plan_exits_zero() {
        let file = write_plan(
            r#"
plan_id: ok
version: 1.0.0
tasks:
  - task_id: A
    agent: CA
    task_type: custom
"#,
        );
        assert_eq!(lint_plan(file.path(), LintFormat::Text).unwrap(), 0);
        assert_eq!(lint_plan(file.path(), LintFormat::Json).unwrap(), 0);
    }

    #[test]
    fn cyclic_plan_exits_nonzero() {
        let file = write_plan(
            r#"
plan_id: cyclic
version: 1.0.0
tasks:
  - task_id: A
    agent: CA
    task_type: custom
    dependencies: [B]
  - task_id: B
    agent: CA
    task_type: custom
    dependencies: [A]
"#,
        );
        assert_eq!(lint_plan(file.path(), LintFormat::Text).unwrap(), 1);
    }

    #[test]
    fn missing_file_exits_nonzero() {
        assert_eq!(
            lint_plan(Path::new("/nonexistent/plan.yaml"), LintFormat::Text).unwrap(),
            1
        );
    }
}
