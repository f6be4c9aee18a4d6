use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nodeflow_core::config::LlmProviderKind;
use nodeflow_core::storage::{load_file, JsonlResultSink};
use nodeflow_core::workflow::{lint_definition, validate_definition};
use nodeflow_core::{DefinitionError, Payload, RunStatus, WorkflowDefinition, WorkflowEngine};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod config;

use config::{CliConfig, LlmOverrides};

#[derive(Parser, Debug)]
#[command(name = "nodeflow")]
#[command(about = "Run typed node-graph workflows from the command line", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "nodeflow.toml", env = "NODEFLOW_CONFIG")]
    config: PathBuf,

    /// Data directory for recorded results
    #[arg(short, long, default_value = "./data", env = "NODEFLOW_DATA_DIR")]
    data_dir: PathBuf,

    /// Generative-text provider: openai, gemini or none
    #[arg(long, env = "NODEFLOW_LLM_PROVIDER")]
    llm_provider: Option<LlmProviderKind>,

    /// API key for the generative-text provider
    #[arg(long, env = "NODEFLOW_LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    /// Default model for `llm` nodes
    #[arg(long, env = "NODEFLOW_LLM_MODEL")]
    llm_model: Option<String>,

    /// Override the provider API root
    #[arg(long, env = "NODEFLOW_LLM_BASE_URL")]
    llm_base_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a workflow definition without running it
    Validate {
        /// Workflow file (.json or .toml)
        file: PathBuf,
    },
    /// Execute a workflow and print the execution state
    Run {
        /// Workflow file (.json or .toml)
        file: PathBuf,

        /// Input data as a JSON object
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read input data from a JSON file
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Do not record the result under the data directory
        #[arg(long)]
        no_record: bool,
    },
    /// List registered node types
    Types,
    /// Show recorded runs of a workflow
    History {
        workflow_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = CliConfig::load(&args.config, args.data_dir.clone())?;
    config.apply(LlmOverrides {
        provider: args.llm_provider,
        api_key: args.llm_api_key,
        model: args.llm_model,
        base_url: args.llm_base_url,
    });

    match args.command {
        Command::Validate { file } => validate(&file).await,
        Command::Run {
            file,
            input,
            input_file,
            no_record,
        } => {
            let input = read_input(input.as_deref(), input_file.as_deref()).await?;
            run(&config, &file, input, !no_record).await
        }
        Command::Types => {
            let engine = WorkflowEngine::new(config.engine.clone());
            for node_type in engine.registry().list_types() {
                println!("{}", node_type);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::History { workflow_id } => history(&config, &workflow_id).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "nodeflow=info".into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn validate(file: &Path) -> Result<ExitCode> {
    let definition = load_file(file).await?;

    let warnings = match check_definition(&definition) {
        Ok(warnings) => warnings,
        Err(e) => {
            eprintln!("Invalid workflow '{}': {}", definition.id, e);
            return Ok(ExitCode::FAILURE);
        }
    };

    for warning in warnings {
        println!("warning: {}", warning);
    }
    println!(
        "Workflow '{}' is valid ({} nodes)",
        definition.id,
        definition.nodes.len()
    );
    Ok(ExitCode::SUCCESS)
}

/// Structural errors, then reachability warnings, each reported once
fn check_definition(definition: &WorkflowDefinition) -> Result<Vec<String>, DefinitionError> {
    validate_definition(definition)?;
    Ok(lint_definition(definition))
}

async fn run(config: &CliConfig, file: &Path, input: Payload, record: bool) -> Result<ExitCode> {
    let definition = load_file(file).await?;

    let mut engine = WorkflowEngine::new(config.engine.clone());
    if record {
        let sink = JsonlResultSink::new(config.results_path())
            .context("Failed to open results directory")?;
        engine = engine.with_sink(Arc::new(sink));
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    let state = engine.execute_with_cancel(&definition, input, cancel).await;
    engine.record(&state).await;

    println!(
        "{}",
        serde_json::to_string_pretty(&state).context("Failed to serialize execution state")?
    );

    Ok(if state.status == RunStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn history(config: &CliConfig, workflow_id: &str) -> Result<ExitCode> {
    let sink = JsonlResultSink::new(config.results_path())
        .context("Failed to open results directory")?;
    let runs = sink.runs_for_workflow(workflow_id).await?;

    if runs.is_empty() {
        println!("No recorded runs for workflow '{}'", workflow_id);
        return Ok(ExitCode::SUCCESS);
    }

    for run in runs {
        let started = run
            .start_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let duration = run
            .duration_secs()
            .map(|d| format!("{:.3}s", d))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {}  {:<9}  {:>9}  {} nodes{}",
            run.execution_id,
            started,
            run.status.as_str(),
            duration,
            run.executed_nodes.len(),
            run.error
                .map(|e| format!("  error: {}", e))
                .unwrap_or_default()
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn read_input(inline: Option<&str>, file: Option<&Path>) -> Result<Payload> {
    let text = match (inline, file) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read input file {}", path.display()))?,
        (None, None) => return Ok(Payload::new()),
    };

    match serde_json::from_str::<Value>(&text).context("Input is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("Input must be a JSON object, got {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_input() {
        assert!(read_input(None, None).await.unwrap().is_empty());

        let parsed = read_input(Some(r#"{"user_id": 42}"#), None).await.unwrap();
        assert_eq!(parsed["user_id"], serde_json::json!(42));

        assert!(read_input(Some("[1, 2]"), None).await.is_err());
        assert!(read_input(Some("not json"), None).await.is_err());
    }

    #[tokio::test]
    async fn test_demo_workflows_are_valid() {
        let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos");
        let engine = WorkflowEngine::new(Default::default());

        for name in ["order_routing.json", "summarize.toml"] {
            let definition = load_file(&demos.join(name)).await.unwrap();
            engine.validate(&definition).unwrap();
            assert!(check_definition(&definition).unwrap().is_empty(), "{} has warnings", name);
        }

        let config = CliConfig::load(&demos.join("nodeflow.toml"), demos.clone()).unwrap();
        assert_eq!(config.engine.max_iterations, 100);
    }

    #[tokio::test]
    async fn test_demo_order_routing_runs() {
        let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos");
        let definition = load_file(&demos.join("order_routing.json")).await.unwrap();
        let engine = WorkflowEngine::new(Default::default());

        let input = read_input(
            Some(r#"{"order_id": "A1", "items": [{"price": 12.5, "qty": 2}]}"#),
            None,
        )
        .await
        .unwrap();
        let state = engine.execute(&definition, input).await;

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.executed_nodes, vec!["price", "check_total", "confirm"]);
        assert_eq!(state.global_state["priced"], serde_json::json!(true));
        assert_eq!(state.output_data.unwrap()["order_id"], serde_json::json!("A1"));
    }

    #[test]
    fn test_check_definition_reports_each_warning_once() {
        let definition: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": "wf",
            "start_node": "a",
            "nodes": [
                {"id": "a", "name": "A", "type": "delay", "config": {"seconds": 0}},
                {"id": "orphan", "name": "Orphan", "type": "delay", "config": {"seconds": 0}}
            ]
        }))
        .unwrap();

        let warnings = check_definition(&definition).unwrap();
        assert_eq!(
            warnings,
            vec!["Node 'orphan' is unreachable from start node 'a'".to_string()]
        );

        let mut broken = definition;
        broken.start_node = "missing".to_string();
        assert!(matches!(
            check_definition(&broken),
            Err(DefinitionError::MissingStartNode(_))
        ));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "nodeflow",
            "--llm-provider",
            "gemini",
            "run",
            "flow.json",
            "--input",
            "{}",
            "--no-record",
        ])
        .unwrap();
        assert_eq!(args.llm_provider, Some(LlmProviderKind::Gemini));
        assert!(matches!(args.command, Command::Run { no_record: true, .. }));
    }
}
