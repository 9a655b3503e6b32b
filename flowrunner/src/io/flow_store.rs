//! Flow load helpers with schema validation and compilation.

use std::fs;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::debug;

use crate::flow::{CompileReport, FlowDefinition, compile};

/// Embedded JSON Schema for flow definitions (Draft 2020-12).
pub const FLOW_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/flow_definition/v1.schema.json"
));

/// Content-derived version string, stable for identical flow text.
pub fn flow_version(contents: &str) -> String {
    let mut hasher = DefaultHasher::new();
    contents.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Validate, deserialize, and compile flow JSON.
///
/// `origin` names the source in error messages. Compile failures keep their
/// [`crate::error::CompileErrors`] type so callers can downcast.
pub fn parse_flow(contents: &str, origin: &str) -> Result<CompileReport> {
    let value: Value =
        serde_json::from_str(contents).with_context(|| format!("parse flow {origin}"))?;
    validate_schema(&value).with_context(|| format!("validate flow {origin}"))?;
    // From the text, not the `Value`: a JSON object keeps only the last of
    // repeated keys, which would hide alias remaps.
    let definition: FlowDefinition = serde_json::from_str(contents)
        .with_context(|| format!("deserialize flow {origin}"))?;
    let version = flow_version(contents);
    let report = compile(definition, version.clone())
        .with_context(|| format!("compile flow {origin}"))?;
    debug!(
        origin,
        version = %version,
        nodes = report.model.nodes().len(),
        warnings = report.warnings.len(),
        "flow compiled"
    );
    Ok(report)
}

/// Load and compile a flow definition from disk.
pub fn load_flow(path: &Path) -> Result<CompileReport> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read flow {}", path.display()))?;
    parse_flow(&contents, &path.display().to_string())
}

fn validate_schema(flow: &Value) -> Result<()> {
    let schema_value: Value = serde_json::from_str(FLOW_SCHEMA).context("parse flow schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(flow) {
        let messages = compiled
            .iter_errors(flow)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "flow schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
