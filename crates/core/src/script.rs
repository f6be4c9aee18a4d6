//! Sandboxed script execution.
//!
//! Scripts are written in Rhai and run on the blocking thread pool. The engine
//! is built without file, network or process access; module imports resolve
//! to nothing and `eval` is disabled. Every run carries a wall-clock deadline
//! and a cancellation flag that the engine polls while the script executes.

use crate::config::ScriptConfig;
use crate::error::ScriptError;
use crate::types::Payload;
use rhai::{Dynamic, Engine, EvalAltResult, Position, Scope, AST};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How many engine operations pass between deadline checks
const PROGRESS_CHECK_INTERVAL: u64 = 256;

/// A compiled script, cheap to clone and share across attempts
#[derive(Clone)]
pub struct Script {
    ast: Arc<AST>,
}

/// Values the script left behind
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutcome {
    /// Contents of `output`, or `None` when the script never filled it
    pub output: Option<Payload>,
    /// The `context` map after the run
    pub context: Payload,
}

/// Compiles and runs scripts under the configured resource limits
pub struct ScriptRunner {
    config: ScriptConfig,
}

impl ScriptRunner {
    pub fn new(config: ScriptConfig) -> Self {
        Self { config }
    }

    pub fn compile(&self, code: &str) -> Result<Script, ScriptError> {
        let engine = build_engine(&self.config);
        let ast = engine
            .compile(code)
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        Ok(Script { ast: Arc::new(ast) })
    }

    /// Run `script` with `input_data`, `context` and an empty `output` map in scope.
    ///
    /// Dropping the returned future cancels the script.
    pub async fn run(
        &self,
        script: &Script,
        input: &Payload,
        context: &Payload,
        timeout: Duration,
    ) -> Result<ScriptOutcome, ScriptError> {
        self.run_with_flag(script, input, context, timeout, Arc::new(AtomicBool::new(false)))
            .await
    }

    /// Like [`run`](Self::run), but the script also stops once `cancelled` is set
    async fn run_with_flag(
        &self,
        script: &Script,
        input: &Payload,
        context: &Payload,
        timeout: Duration,
        cancelled: Arc<AtomicBool>,
    ) -> Result<ScriptOutcome, ScriptError> {
        let _guard = CancelOnDrop(cancelled.clone());

        let config = self.config.clone();
        let ast = script.ast.clone();
        let input = Value::Object(input.clone());
        let context = Value::Object(context.clone());

        let handle = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + timeout;
            let mut engine = build_engine(&config);
            engine.on_progress(move |count| {
                if count % PROGRESS_CHECK_INTERVAL != 0 {
                    return None;
                }
                if cancelled.load(Ordering::Relaxed) {
                    Some(Dynamic::from(true))
                } else if Instant::now() >= deadline {
                    Some(Dynamic::from(false))
                } else {
                    None
                }
            });

            evaluate(&engine, &ast, input, context, timeout)
        });

        handle
            .await
            .map_err(|e| ScriptError::Runtime(format!("script worker failed: {}", e)))?
    }
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self::new(ScriptConfig::default())
    }
}

struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

fn evaluate(
    engine: &Engine,
    ast: &AST,
    input: Value,
    context: Value,
    timeout: Duration,
) -> Result<ScriptOutcome, ScriptError> {
    let mut scope = Scope::new();
    scope.push_dynamic("input_data", to_dynamic(input)?);
    scope.push_dynamic("context", to_dynamic(context)?);
    scope.push("output", rhai::Map::new());

    engine
        .run_ast_with_scope(&mut scope, ast)
        .map_err(|e| classify(*e, timeout))?;

    let output = match scope.get_value::<Dynamic>("output") {
        None => None,
        Some(value) if value.is_unit() => None,
        Some(value) => match from_dynamic(&value)? {
            Value::Object(map) if map.is_empty() => None,
            Value::Object(map) => Some(map),
            other => {
                return Err(ScriptError::Runtime(format!(
                    "'output' must be a map, got {}",
                    other
                )))
            }
        },
    };

    let context = match scope.get_value::<Dynamic>("context") {
        Some(value) => match from_dynamic(&value)? {
            Value::Object(map) => map,
            _ => Payload::new(),
        },
        None => Payload::new(),
    };

    Ok(ScriptOutcome { output, context })
}

fn classify(err: EvalAltResult, timeout: Duration) -> ScriptError {
    match err {
        EvalAltResult::ErrorTerminated(token, _) => {
            if token.as_bool().unwrap_or(false) {
                ScriptError::Cancelled
            } else {
                ScriptError::Timeout {
                    secs: timeout.as_secs_f64(),
                }
            }
        }
        other => ScriptError::Runtime(other.to_string()),
    }
}

fn to_dynamic(value: Value) -> Result<Dynamic, ScriptError> {
    rhai::serde::to_dynamic(value).map_err(|e| ScriptError::Runtime(e.to_string()))
}

fn from_dynamic(value: &Dynamic) -> Result<Value, ScriptError> {
    rhai::serde::from_dynamic::<Value>(value).map_err(|e| ScriptError::Runtime(e.to_string()))
}

fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message.into()),
        Position::NONE,
    ))
}

fn build_engine(config: &ScriptConfig) -> Engine {
    let mut engine = Engine::new();

    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
    engine.disable_symbol("eval");

    engine.set_max_operations(config.max_operations);
    engine.set_max_string_size(config.max_string_size);
    engine.set_max_array_size(config.max_array_size);
    engine.set_max_map_size(config.max_map_size);
    engine.set_max_call_levels(config.max_call_levels);
    engine.set_max_expr_depths(config.max_expr_depth, config.max_expr_depth);

    engine.on_print(|text| tracing::info!(target: "nodeflow::script", "{}", text));
    engine.on_debug(|text, source, pos| {
        tracing::debug!(target: "nodeflow::script", ?source, %pos, "{}", text)
    });

    engine.register_fn("json_encode", |value: Dynamic| -> Result<String, Box<EvalAltResult>> {
        serde_json::to_string(&value).map_err(|e| runtime_error(e.to_string()))
    });
    engine.register_fn("json_decode", |text: &str| -> Result<Dynamic, Box<EvalAltResult>> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| runtime_error(format!("invalid JSON: {}", e)))?;
        rhai::serde::to_dynamic(value)
    });
    engine.register_fn("now_ms", || chrono::Utc::now().timestamp_millis());

    engine
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    async fn run(code: &str, input: Value, timeout: Duration) -> Result<ScriptOutcome, ScriptError> {
        let runner = ScriptRunner::default();
        let script = runner.compile(code)?;
        let context = payload(json!({"workflow_id": "wf", "global_state": {"count": 1}}));
        runner.run(&script, &payload(input), &context, timeout).await
    }

    #[tokio::test]
    async fn test_output_is_collected() {
        let outcome = run(
            r#"
                let total = 0;
                for item in input_data.items { total += item; }
                output.total = total;
                output.workflow = context.workflow_id;
            "#,
            json!({"items": [1, 2, 3]}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let output = outcome.output.unwrap();
        assert_eq!(output["total"], json!(6));
        assert_eq!(output["workflow"], json!("wf"));
    }

    #[tokio::test]
    async fn test_untouched_output_is_none() {
        let outcome = run("let x = 1 + 1;", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.output.is_none());
    }

    #[tokio::test]
    async fn test_context_changes_are_returned() {
        let outcome = run(
            "context.global_state.count += 1; context.global_state.seen = true;",
            json!({}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(outcome.context["global_state"], json!({"count": 2, "seen": true}));
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let outcome = run(
            r#"
                let parsed = json_decode(input_data.raw);
                output.name = parsed.name;
                output.encoded = json_encode(#{ ok: true });
                output.now_positive = now_ms() > 0;
            "#,
            json!({"raw": "{\"name\": \"ada\"}"}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let output = outcome.output.unwrap();
        assert_eq!(output["name"], json!("ada"));
        assert_eq!(output["encoded"], json!("{\"ok\":true}"));
        assert_eq!(output["now_positive"], json!(true));
    }

    #[tokio::test]
    async fn test_thrown_error_is_runtime() {
        let err = run(r#"throw "bad input";"#, json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Runtime(ref m) if m.contains("bad input")));
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let started = Instant::now();
        let err = run("loop { }", json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_dropping_the_future_stops_the_worker() {
        let runner = ScriptRunner::default();
        let script = runner.compile("loop { }").unwrap();
        let input = Payload::new();
        let context = Payload::new();
        let flag = Arc::new(AtomicBool::new(false));

        let attempt = tokio::time::timeout(
            Duration::from_millis(50),
            runner.run_with_flag(&script, &input, &context, Duration::from_secs(3600), flag.clone()),
        )
        .await;
        assert!(attempt.is_err());
        assert!(flag.load(Ordering::Relaxed));

        // the worker's engine holds the last other reference; it goes away once the loop stops
        let started = Instant::now();
        while Arc::strong_count(&flag) > 1 {
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "script worker still running after its future was dropped"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_cancel_flag_terminates_running_script() {
        let runner = ScriptRunner::default();
        let script = runner.compile("loop { }").unwrap();
        let flag = Arc::new(AtomicBool::new(false));

        let trigger = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.store(true, Ordering::Relaxed);
        });

        let started = Instant::now();
        let err = runner
            .run_with_flag(
                &script,
                &Payload::new(),
                &Payload::new(),
                Duration::from_secs(3600),
                flag,
            )
            .await
            .unwrap_err();
        assert_eq!(err, ScriptError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_sandbox_rejects_eval_and_syntax_errors() {
        let runner = ScriptRunner::default();
        assert!(matches!(
            runner.compile(r#"eval("1 + 1")"#),
            Err(ScriptError::Compile(_))
        ));
        assert!(matches!(runner.compile("let = ;"), Err(ScriptError::Compile(_))));
    }

    #[tokio::test]
    async fn test_imports_do_not_resolve() {
        let err = run(r#"import "std" as s;"#, json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Runtime(_)));
    }
}
