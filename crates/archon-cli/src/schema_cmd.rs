//! `archon schema-check`: validate a plan or message document against
//! its schema.

use std::path::Path;

use anyhow::{Context, Result};

use archon_core::plan::Plan;
use archon_postbox::Envelope;

/// What kind of document to check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DocType {
    Plan,
    Message,
    Auto,
}

/// Validate a document. Returns the process exit code (0 valid,
/// 1 invalid).
pub fn schema_check(file: &Path, doc_type: DocType) -> Result<u8> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;

    let doc_type = match doc_type {
        DocType::Auto => infer_doc_type(file, &contents),
        other => other,
    };

    let result = match doc_type {
        DocType::Plan => check_plan(&contents),
        DocType::Message => check_message(&contents),
        DocType::Auto => unreachable!("auto resolved above"),
    };

    match result {
        Ok(description) => {
            println!("{}: valid {description}", file.display());
            Ok(0)
        }
        Err(message) => {
            eprintln!("{}: {message}", file.display());
            Ok(1)
        }
    }
}

fn check_plan(contents: &str) -> Result<String, String> {
    match Plan::from_str(contents) {
        Ok(plan) => Ok(format!("plan ({} tasks)", plan.tasks.len())),
        Err(e) => Err(format!("invalid plan: {e}")),
    }
}

fn check_message(contents: &str) -> Result<String, String> {
    let envelope = Envelope::decode(contents).map_err(|e| format!("invalid message: {e}"))?;
    envelope
        .validate()
        .map_err(|e| format!("invalid message: {e}"))?;
    Ok(format!("message ({})", envelope.kind))
}

/// JSON documents are messages; YAML documents are plans.
fn infer_doc_type(file: &Path, contents: &str) -> DocType {
    match file.extension().and_then(|e| e.to_str()) {
        Some("json") => DocType::Message,
        Some("yaml") | Some("yml") => DocType::Plan,
        _ if contents.trim_start().starts_with('{') => DocType::Message,
        _ => DocType::Plan,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(name: &str, contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn valid_plan_yaml_passes() {
        let (_dir, path) = write_file(
            "plan.yaml",
            r#"
plan_id: ok
version: 1.0.0
tasks:
  - task_id: A
    agent: CA
    task_type: custom
"#,
        );
        assert_eq!(schema_check(&path, DocType::Auto).unwrap(), 0);
    }

    #[test]
    fn valid_message_json_passes() {
        let (_dir, path) = write_file(
            "message.json",
            r#"{
  "type": "task_result",
  "protocol_version": "1.3",
  "sender_id": "CA",
  "recipient_id": "ARCH",
  "timestamp": "2025-06-01T12:00:00Z",
  "task_id": "T1",
  "payload": {"status": "success", "success": true, "score": 0.9}
}"#,
        );
        assert_eq!(schema_check(&path, DocType::Auto).unwrap(), 0);
    }

    #[test]
    fn inconsistent_message_fails() {
        let (_dir, path) = write_file(
            "message.json",
            r#"{
  "type": "task_result",
  "protocol_version": "1.3",
  "sender_id": "CA",
  "recipient_id": "ARCH",
  "timestamp": "2025-06-01T12:00:00Z",
  "task_id": "T1",
  "payload": {"status": "failed", "success": true}
}"#,
        );
        assert_eq!(schema_check(&path, DocType::Auto).unwrap(), 1);
    }

    #[test]
    fn explicit_type_overrides_inference() {
        let (_dir, path) = write_file("data.txt", "{\"type\": \"bogus\"}");
        assert_eq!(schema_check(&path, DocType::Message).unwrap(), 1);
    }
}
