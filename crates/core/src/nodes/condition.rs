use super::{merge, Node, NodeContext, NodeInit, NodeOutput, CONDITION};
use crate::error::NodeError;
use crate::template::lookup;
use crate::types::Payload;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;

/// Comparison operators supported by condition nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "in")]
    In,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Contains => "contains",
            Self::In => "in",
        }
    }

    /// Apply the operator. An `Err` means the operands cannot be compared this way.
    pub fn evaluate(&self, field_value: &Value, compare_value: &Value) -> Result<bool, String> {
        match self {
            Self::Eq => Ok(loosely_equal(field_value, compare_value)),
            Self::Ne => Ok(!loosely_equal(field_value, compare_value)),
            Self::Gt => order(field_value, compare_value).map(|o| o == Ordering::Greater),
            Self::Lt => order(field_value, compare_value).map(|o| o == Ordering::Less),
            Self::Ge => order(field_value, compare_value).map(|o| o != Ordering::Less),
            Self::Le => order(field_value, compare_value).map(|o| o != Ordering::Greater),
            Self::Contains => contains(field_value, compare_value),
            Self::In => contains(compare_value, field_value),
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Result<Ordering, String> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .ok_or_else(|| format!("cannot order {} and {}", x, y)),
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        _ => Err(format!(
            "cannot order {} and {}",
            kind_of(a),
            kind_of(b)
        )),
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, String> {
    match (container, item) {
        (Value::String(haystack), Value::String(needle)) => Ok(haystack.contains(needle.as_str())),
        (Value::Array(items), _) => Ok(items.iter().any(|v| loosely_equal(v, item))),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        _ => Err(format!(
            "{} cannot contain {}",
            kind_of(container),
            kind_of(item)
        )),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Deserialize)]
struct ConditionConfig {
    field: String,
    operator: Operator,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    true_branch: Option<String>,
    #[serde(default)]
    false_branch: Option<String>,
}

/// Evaluates a predicate on the input and picks one successor branch
pub struct ConditionNode {
    id: String,
    config: ConditionConfig,
}

impl ConditionNode {
    pub fn construct(init: NodeInit<'_>) -> Result<Box<dyn Node>, NodeError> {
        let config: ConditionConfig = init.parse_config()?;
        if config.field.trim().is_empty() {
            return Err(init.invalid("'field' and 'operator' are required for Condition node"));
        }
        Ok(Box::new(Self {
            id: init.id.to_string(),
            config,
        }))
    }
}

#[async_trait::async_trait]
impl Node for ConditionNode {
    fn node_type(&self) -> &str {
        CONDITION
    }

    async fn execute(&self, input: &Payload, _ctx: &mut NodeContext) -> Result<NodeOutput, NodeError> {
        let config = &self.config;
        let field_value = lookup(input, &config.field).cloned().unwrap_or(Value::Null);

        let result = config
            .operator
            .evaluate(&field_value, &config.value)
            .unwrap_or_else(|reason| {
                tracing::warn!(node_id = %self.id, "Error evaluating condition: {}", reason);
                false
            });

        tracing::info!(
            node_id = %self.id,
            "Condition evaluation: {}={} {} {} = {}",
            config.field,
            field_value,
            config.operator,
            config.value,
            result
        );

        let branch = if result {
            config.true_branch.clone()
        } else {
            config.false_branch.clone()
        };

        let data = merge(
            input,
            "_condition_result",
            json!({
                "field": config.field,
                "field_value": field_value,
                "operator": config.operator,
                "compare_value": config.value,
                "result": result,
                "next_branch": branch,
            }),
        );

        Ok(NodeOutput::new(data).with_next_nodes(branch.into_iter().collect()))
    }
}
