//! RW-018: CLI subcommands: validate, order, run, pipe, schema.

use crate::cache::DataLayer;
use crate::core::config::EngineOptions;
use crate::core::executor::Executor;
use crate::core::graph::DependencyGraph;
use crate::core::types::{DocumentSpec, Event, PipeOp, RunOutput};
use crate::core::{parser, pipe};
use crate::transport::{MemoryRelay, StaticSigner};
use clap::Subcommand;
use serde::Serialize;
use serde_json::{Map, Value};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check a document for unknown references, trigger targets and cycles
    Validate {
        /// Path to the document (.json, .yaml, .yml)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Print the dependency-respecting execution order
    Order {
        /// Path to the document
        #[arg(short, long)]
        file: PathBuf,

        /// Only these queries and their dependencies
        #[arg(short, long)]
        query: Vec<String>,
    },

    /// Run every query against an in-memory relay and print the results
    Run {
        /// Path to the document
        #[arg(short, long)]
        file: PathBuf,

        /// JSON array of records to seed the relay with
        #[arg(long)]
        fixture: Option<PathBuf>,

        /// Engine options (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Signed-in user's public key
        #[arg(long)]
        pubkey: Option<String>,

        /// Action to execute after the initial run
        #[arg(short, long)]
        action: Option<String>,

        /// Form data for --action, as a JSON object
        #[arg(long)]
        form: Option<String>,
    },

    /// Apply a pipe to a JSON value
    Pipe {
        /// Pipe as a JSON array of operations
        #[arg(short, long)]
        pipe: String,

        /// Input JSON file (default: stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Print the JSON Schema of the document format
    Schema,
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Order { file, query } => cmd_order(&file, &query),
        Commands::Run {
            file,
            fixture,
            config,
            pubkey,
            action,
            form,
        } => cmd_run(
            &file,
            fixture.as_deref(),
            config.as_deref(),
            pubkey,
            action.as_deref(),
            form.as_deref(),
        ),
        Commands::Pipe { pipe, input } => cmd_pipe(&pipe, input.as_deref()),
        Commands::Schema => cmd_schema(),
    }
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let doc = parser::parse_document_file(file)?;
    let errors = parser::validate_document(&doc);

    if errors.is_empty() {
        println!(
            "OK: {} ({} queries, {} actions)",
            file.display(),
            doc.queries.len(),
            doc.events.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

fn parse_and_validate(file: &Path) -> Result<DocumentSpec, String> {
    let doc = parser::parse_document_file(file)?;
    let errors = parser::validate_document(&doc);
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        return Err(format!("{} validation error(s)", errors.len()));
    }
    Ok(doc)
}

fn cmd_order(file: &Path, queries: &[String]) -> Result<(), String> {
    let doc = parse_and_validate(file)?;
    for (index, name) in execution_order(&doc, queries)?.iter().enumerate() {
        println!("{:>3}. ${}", index + 1, name);
    }
    Ok(())
}

fn execution_order(doc: &DocumentSpec, queries: &[String]) -> Result<Vec<String>, String> {
    let graph = DependencyGraph::from_document(doc);
    let order = if queries.is_empty() {
        graph.execution_order()
    } else {
        let roots: Vec<String> = queries
            .iter()
            .map(|q| q.trim_start_matches('$').to_string())
            .collect();
        let roots: Vec<&str> = roots.iter().map(String::as_str).collect();
        graph.order_for(&roots)
    };
    order.map_err(|e| e.to_string())
}

fn load_fixture(path: &Path) -> Result<Vec<Event>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&content).map_err(|e| format!("fixture {}: {}", path.display(), e))
}

fn parse_form(form: Option<&str>) -> Result<Map<String, Value>, String> {
    match form {
        None => Ok(Map::new()),
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err("--form must be a JSON object".to_string()),
            Err(e) => Err(format!("--form: {e}")),
        },
    }
}

#[derive(Serialize)]
struct RunReport {
    initial: RunOutput,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<crate::core::action::ActionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    after_action: Option<RunOutput>,
}

fn cmd_run(
    file: &Path,
    fixture: Option<&Path>,
    config: Option<&Path>,
    pubkey: Option<String>,
    action: Option<&str>,
    form: Option<&str>,
) -> Result<(), String> {
    let doc = parse_and_validate(file)?;
    let options = match config {
        Some(path) => EngineOptions::load(path)?,
        None => EngineOptions::default(),
    };
    options.validate()?;
    let events = match fixture {
        Some(path) => load_fixture(path)?,
        None => Vec::new(),
    };
    let form = parse_form(form)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start runtime: {e}"))?;
    let report = runtime.block_on(run_document(doc, events, options, pubkey, action, form))?;

    let json = serde_json::to_string_pretty(&report).map_err(|e| format!("JSON error: {e}"))?;
    println!("{json}");
    Ok(())
}

async fn run_document(
    doc: DocumentSpec,
    events: Vec<Event>,
    options: EngineOptions,
    pubkey: Option<String>,
    action: Option<&str>,
    form: Map<String, Value>,
) -> Result<RunReport, String> {
    let relay = MemoryRelay::with_events(events);
    let layer = DataLayer::new(Arc::new(relay), &options);
    let mut builder = Executor::builder(doc, layer).options(options);
    if let Some(pubkey) = pubkey {
        builder = builder
            .signer(Arc::new(StaticSigner::new(pubkey.clone())))
            .user(pubkey);
    }
    let executor = builder.build();

    let initial = executor.run_all().await.map_err(|e| e.to_string())?;
    let mut report = RunReport {
        initial,
        action: None,
        after_action: None,
    };
    if let Some(action) = action {
        let outcome = executor.execute_action(action, form).await;
        if let Some(err) = &outcome.error {
            tracing::warn!(action, error = %err, "action failed");
        }
        report.action = Some(outcome);
        report.after_action = Some(executor.snapshot());
    }
    executor.teardown();
    Ok(report)
}

fn cmd_pipe(pipe_json: &str, input: Option<&Path>) -> Result<(), String> {
    let ops: Vec<PipeOp> =
        serde_json::from_str(pipe_json).map_err(|e| format!("invalid pipe: {e}"))?;
    let raw = match input {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("failed to read stdin: {e}"))?;
            buf
        }
    };
    let value: Value = serde_json::from_str(&raw).map_err(|e| format!("invalid input: {e}"))?;
    let output = pipe::apply(value, &ops);
    let json = serde_json::to_string_pretty(&output).map_err(|e| format!("JSON error: {e}"))?;
    println!("{json}");
    Ok(())
}

fn document_schema() -> Result<String, String> {
    let schema = schemars::schema_for!(DocumentSpec);
    serde_json::to_string_pretty(&schema).map_err(|e| format!("JSON error: {e}"))
}

fn cmd_schema() -> Result<(), String> {
    println!("{}", document_schema()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DOC: &str = r#"{
        "queries": {
            "$contacts": {"kinds": [3], "authors": ["user.pubkey"], "limit": 1,
                          "pipe": [{"op": "first"}, {"op": "pluckTag", "tag": "p"}]},
            "$feed": {"kinds": [1], "authors": "$contacts",
                      "pipe": [{"op": "pluck", "field": "content"}]}
        },
        "events": {
            "@post": {"kind": 1, "content": "{form.message}"}
        }
    }"#;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn fixture() -> Vec<Event> {
        serde_json::from_value(json!([
            {"id": "c1", "pubkey": "me", "created_at": 10, "kind": 3, "tags": [["p", "alice"], ["p", "bob"]]},
            {"id": "n1", "pubkey": "alice", "created_at": 20, "kind": 1, "content": "hello"},
            {"id": "n2", "pubkey": "carol", "created_at": 30, "kind": 1, "content": "not followed"}
        ]))
        .unwrap()
    }

    #[test]
    fn test_rw018_validate_valid() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "doc.json", DOC);
        cmd_validate(&file).unwrap();
    }

    #[test]
    fn test_rw018_validate_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(
            dir.path(),
            "bad.yaml",
            "queries:\n  $q:\n    authors: $ghost\n    triggers: \"@nothing\"\n",
        );
        let err = cmd_validate(&file).unwrap_err();
        assert_eq!(err, "2 validation error(s)");
    }

    #[test]
    fn test_rw018_validate_missing_file() {
        assert!(cmd_validate(Path::new("/nonexistent/doc.json")).is_err());
    }

    #[test]
    fn test_rw018_execution_order() {
        let doc = parser::parse_document(DOC).unwrap();
        assert_eq!(execution_order(&doc, &[]).unwrap(), vec!["contacts", "feed"]);
        assert_eq!(
            execution_order(&doc, &["$contacts".to_string()]).unwrap(),
            vec!["contacts"]
        );
        assert!(execution_order(&doc, &["ghost".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_rw018_run_document_with_action() {
        let doc = parser::parse_document(DOC).unwrap();
        let options = EngineOptions {
            live: false,
            ..Default::default()
        };
        let form = parse_form(Some(r#"{"message": "gm"}"#)).unwrap();
        let report = run_document(doc, fixture(), options, Some("me".into()), Some("post"), form)
            .await
            .unwrap();

        assert_eq!(report.initial.query_results["contacts"], json!(["alice", "bob"]));
        assert_eq!(report.initial.query_results["feed"], json!(["hello"]));
        let outcome = report.action.unwrap();
        assert!(outcome.is_success(), "{outcome:?}");
        let after = report.after_action.unwrap();
        assert_eq!(after.extracted_variables["@post"], json!(outcome.record_id.unwrap()));
    }

    #[tokio::test]
    async fn test_rw018_run_without_pubkey_leaves_queries_pending() {
        let doc = parser::parse_document(DOC).unwrap();
        let report = run_document(doc, fixture(), EngineOptions::default(), None, None, Map::new())
            .await
            .unwrap();
        assert_eq!(report.initial.pending, vec!["contacts", "feed"]);
        assert!(report.action.is_none());
    }

    #[test]
    fn test_rw018_run_rejects_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "doc.json", DOC);
        let config = write(dir.path(), "engine.toml", "max_passes = 0\n");
        assert!(cmd_run(&file, None, Some(&config), None, None, None).is_err());
    }

    #[test]
    fn test_rw018_parse_form() {
        assert!(parse_form(None).unwrap().is_empty());
        assert!(parse_form(Some("[1]")).is_err());
        assert!(parse_form(Some("{oops")).is_err());
    }

    #[test]
    fn test_rw018_pipe_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = write(dir.path(), "in.json", "[3, 1, 2]");
        cmd_pipe(r#"[{"op": "sort"}, {"op": "first"}]"#, Some(&input)).unwrap();
        assert!(cmd_pipe("not a pipe", Some(&input)).is_err());
        assert!(cmd_pipe(r#"[{"op": "bogus"}]"#, Some(&input)).is_err());
    }

    #[test]
    fn test_rw018_schema_names_document_fields() {
        let schema = document_schema().unwrap();
        assert!(schema.contains("\"queries\""));
        assert!(schema.contains("\"events\""));
    }
}
