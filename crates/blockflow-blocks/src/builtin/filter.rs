use futures::future::BoxFuture;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::traits::Block;
use blockflow_core::types::*;

const OPERATORS: &[&str] = &["==", "!=", "contains", ">", "<"];

/// Lets the run continue only when `left <operator> right` holds.
pub struct CompareFilter {
    definition: BlockDefinition,
}

impl CompareFilter {
    pub fn new() -> Self {
        Self {
            definition: BlockDefinition::new("compare", BlockCategory::Filter)
                .with_input(InputField::text("left"))
                .with_input(InputField::select("operator", OPERATORS).with_default("=="))
                .with_input(InputField::text("right"))
                .with_output(OutputField::typed("result", "bool")),
        }
    }
}

impl Default for CompareFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn number(side: &str, raw: &str) -> Result<f64> {
    raw.trim().parse::<f64>().map_err(|_| {
        BlockflowError::block("compare", format!("{} value '{}' is not a number", side, raw))
    })
}

/// Evaluate one comparison. Equality is on strings; `>`/`<` are numeric.
pub fn evaluate(left: &str, operator: &str, right: &str) -> Result<bool> {
    match operator.trim() {
        "==" => Ok(left == right),
        "!=" => Ok(left != right),
        "contains" => Ok(left.contains(right)),
        ">" => Ok(number("left", left)? > number("right", right)?),
        "<" => Ok(number("left", left)? < number("right", right)?),
        other => Err(BlockflowError::block(
            "compare",
            format!("unknown operator '{}'", other),
        )),
    }
}

impl Block for CompareFilter {
    fn definition(&self) -> &BlockDefinition {
        &self.definition
    }

    fn run(&self, inputs: Inputs, _ctx: RunContext) -> BoxFuture<'_, Result<Outputs>> {
        Box::pin(async move {
            let get = |k: &str| inputs.get(k).map(String::as_str).unwrap_or("");
            let (left, operator, right) = (get("left"), get("operator"), get("right"));

            if !evaluate(left, operator, right)? {
                return Err(BlockflowError::Halted(format!(
                    "'{}' {} '{}' is false",
                    left, operator, right
                )));
            }

            let mut out = Outputs::new();
            out.insert("result".into(), "true".into());
            Ok(out)
        })
    }
}
