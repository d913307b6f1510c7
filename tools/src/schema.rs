//! JSON Schema generation and validation for tool parameters

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};

use crate::types::{Params, ToolDefinition};

/// Build a JSON Schema object from the tool's declared parameters
pub fn build_schema(def: &ToolDefinition) -> Value {
    let mut properties = Map::new();
    for p in &def.params {
        properties.insert(
            p.name.clone(),
            json!({ "type": p.kind.as_str(), "description": p.description }),
        );
    }
    let required: Vec<&str> = def.required_params().map(|p| p.name.as_str()).collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Names of required parameters absent from `params` (null counts as absent)
pub fn missing_required(def: &ToolDefinition, params: &Params) -> Vec<String> {
    def.required_params()
        .filter(|p| params.get(&p.name).map_or(true, Value::is_null))
        .map(|p| p.name.clone())
        .collect()
}

/// Validate parameters against the generated schema
pub fn validate_params(def: &ToolDefinition, params: &Params) -> Result<()> {
    let schema = build_schema(def);
    let validator = jsonschema::validator_for(&schema)
        .map_err(|e| anyhow::anyhow!("Invalid JSON schema: {e}"))?;

    let instance = Value::Object(params.clone());
    if let Err(error) = validator.validate(&instance) {
        bail!("{}", error);
    }
    Ok(())
}
