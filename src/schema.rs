use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use schemars::schema_for;
use serde_json::Value;

use crate::condition::ConditionRule;
use crate::flow::FlowDefinition;

/// JSON Schema for flow definition files.
pub fn flow_schema() -> Result<Value> {
    Ok(serde_json::to_value(schema_for!(FlowDefinition))?)
}

pub fn condition_schema() -> Result<Value> {
    Ok(serde_json::to_value(schema_for!(ConditionRule))?)
}

/// Writes `flow.schema.json` and `condition.schema.json` into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let mut written = Vec::new();
    for (name, schema) in [("flow", flow_schema()?), ("condition", condition_schema()?)] {
        let path = out_dir.join(format!("{name}.schema.json"));
        fs::write(&path, serde_json::to_string_pretty(&schema)?)
            .with_context(|| format!("writing {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
