//! Load and save the project policy (`.conductor/policy.json`).
//!
//! The document is validated against an embedded JSON Schema before it is
//! deserialized, then checked for glob patterns that do not parse.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::debug;

use super::atomic::write_json_atomic;
use crate::core::policy::Policy;

pub const POLICY_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/policy.schema.json"
));

/// Load the policy, or the permissive default if the file is missing.
pub fn load_policy(path: &Path) -> Result<Policy> {
    if !path.exists() {
        debug!(path = %path.display(), "no policy file, using default policy");
        return Ok(Policy::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_policy(&contents).with_context(|| format!("load policy {}", path.display()))
}

/// Parse and validate a policy document.
pub fn parse_policy(contents: &str) -> Result<Policy> {
    let value: Value = serde_json::from_str(contents).context("parse policy json")?;
    validate_schema(&value)?;
    let policy: Policy = serde_json::from_value(value).context("deserialize policy")?;
    let invalid = policy.invalid_patterns();
    if !invalid.is_empty() {
        return Err(anyhow!("invalid glob patterns: {}", invalid.join(", ")));
    }
    Ok(policy)
}

pub fn save_policy(path: &Path, policy: &Policy) -> Result<()> {
    let invalid = policy.invalid_patterns();
    if !invalid.is_empty() {
        return Err(anyhow!("invalid glob patterns: {}", invalid.join(", ")));
    }
    write_json_atomic(path, policy)
}

fn validate_schema(value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(POLICY_SCHEMA).context("parse policy schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "policy schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let policy = load_policy(&temp.path().join("policy.json")).expect("load");
        assert_eq!(policy, Policy::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("policy.json");
        let policy = Policy {
            allowed_paths: vec!["src/**".to_string()],
            blocked_commands: vec!["rm -rf".to_string()],
            ..Policy::default()
        };
        save_policy(&path, &policy).expect("save");
        assert_eq!(load_policy(&path).expect("load"), policy);
    }

    #[test]
    fn schema_rejects_unknown_fields_and_negative_limits() {
        let unknown = parse_policy(r#"{"allowed_path": ["src/**"]}"#).expect_err("unknown field");
        assert!(format!("{unknown:#}").contains("schema validation failed"));

        let negative = parse_policy(r#"{"limits": {"max_steps_per_run": -1}}"#);
        assert!(negative.is_err());
    }

    #[test]
    fn partial_limits_fill_defaults() {
        let policy = parse_policy(r#"{"limits": {"max_steps_per_run": 3}}"#).expect("parse");
        assert_eq!(policy.limits.max_steps_per_run, 3);
        assert_eq!(policy.limits.max_files_per_run, 25);
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let err = parse_policy(r#"{"blocked_paths": ["src/[oops"]}"#).expect_err("bad glob");
        assert!(err.to_string().contains("src/[oops"));
    }
}
