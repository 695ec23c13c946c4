// Config and script validation
// Strict mode validates at load time and fails fast with actionable errors;
// permissive mode reports the same findings as warnings to the caller.

use crate::config::config::HarnessConfig;
use crate::config::presets::{CodeTable, SuccessRule};
use crate::config::types::{HarnessError, Result};
use crate::core::script::{Capability, Effect, Input, OutputShape, Script};
use crate::verdict::record::AggregationMode;
use std::collections::{BTreeSet, HashSet};

/// Validation result with detailed errors
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate harness configuration
pub fn validate_config(config: &HarnessConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_timeouts(config, &mut result);
    validate_paths(config, &mut result);
    for (name, table) in &config.code_tables {
        validate_code_table(name, table, &mut result);
    }

    if config.strict_mode && !result.is_valid() {
        let error_msg = format!(
            "Config validation failed in strict mode:\n{}",
            result.errors.join("\n")
        );
        return Err(HarnessError::Config(error_msg));
    }

    Ok(result)
}

fn validate_timeouts(config: &HarnessConfig, result: &mut ValidationResult) {
    if config.default_op_timeout_ms == 0 {
        result.add_error("default_op_timeout_ms cannot be zero".to_string());
    }
    if let Some(run_timeout) = config.run_timeout_ms {
        if run_timeout == 0 {
            result.add_error("run_timeout_ms cannot be zero".to_string());
        } else if run_timeout < config.default_op_timeout_ms {
            result.add_warning(format!(
                "run_timeout_ms ({}) is shorter than default_op_timeout_ms ({}); \
                 the deadline is only checked between phases",
                run_timeout, config.default_op_timeout_ms
            ));
        }
    }
}

fn validate_paths(config: &HarnessConfig, result: &mut ValidationResult) {
    if !config.workspace_root.is_absolute() {
        result.add_error(format!(
            "workspace_root must be an absolute path: {:?}",
            config.workspace_root
        ));
    }
    if let Some(audit_log) = &config.audit_log {
        if audit_log.as_os_str().is_empty() {
            result.add_error("audit_log cannot be an empty path".to_string());
        }
    }
}

fn validate_code_table(name: &str, table: &CodeTable, result: &mut ValidationResult) {
    if table.library != name {
        result.add_warning(format!(
            "code table '{}' is registered under '{}'",
            table.library, name
        ));
    }
    if let SuccessRule::OneOf(codes) = &table.success {
        if codes.is_empty() {
            result.add_error(format!(
                "code table '{}': success set cannot be empty",
                table.id
            ));
        }
    }
    for (code, kind) in &table.codes {
        if kind.is_fatal() {
            result.add_error(format!(
                "code table '{}': code {} maps to {}, which only the tracker may raise",
                table.id, code, kind
            ));
        }
        if table.success.is_success(*code) {
            result.add_warning(format!(
                "code table '{}': code {} is mapped but counts as success",
                table.id, code
            ));
        }
    }
    if let Some(kind) = table.bool_false {
        if kind.is_fatal() {
            result.add_error(format!(
                "code table '{}': boolean false cannot map to {}",
                table.id, kind
            ));
        }
    }
}

/// Validate a script before it runs
pub fn validate_script(script: &Script, strict_mode: bool) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    if script.name.trim().is_empty() {
        result.add_error("script name cannot be empty".to_string());
    }
    if script.library.trim().is_empty() {
        result.add_error("script library cannot be empty".to_string());
    }
    if script.operations.is_empty() {
        result.add_warning(format!("script '{}' has no operations", script.name));
    }

    validate_ordering(script, &mut result);
    validate_bindings(script, &mut result);
    validate_operations(script, &mut result);
    validate_aggregation(script, &mut result);

    if strict_mode && !result.is_valid() {
        let error_msg = format!(
            "Script '{}' failed validation in strict mode:\n{}",
            script.name,
            result.errors.join("\n")
        );
        return Err(HarnessError::Script(error_msg));
    }

    Ok(result)
}

/// Phases never go backwards; ids are unique.
fn validate_ordering(script: &Script, result: &mut ValidationResult) {
    let mut seen = HashSet::new();
    for pair in script.operations.windows(2) {
        if pair[1].phase < pair[0].phase {
            result.add_error(format!(
                "{} {} ({}) follows {} {} ({}); phases must not go backwards",
                pair[1].id(),
                pair[1].name,
                pair[1].phase,
                pair[0].id(),
                pair[0].name,
                pair[0].phase
            ));
        }
    }
    for op in &script.operations {
        if !seen.insert(op.id()) {
            result.add_error(format!("duplicate operation id {}", op.id()));
        }
    }
}

fn validate_bindings(script: &Script, result: &mut ValidationResult) {
    let mut handles: BTreeSet<&str> = BTreeSet::new();
    let mut scalars: BTreeSet<&str> = BTreeSet::new();

    for op in &script.operations {
        for input in &op.inputs {
            match input {
                Input::Handle(name) if !handles.contains(name.as_str()) => {
                    result.add_error(format!(
                        "{} {}: handle binding '{}' is used before it is defined",
                        op.id(),
                        op.name,
                        name
                    ));
                }
                Input::Scalar(name) if !scalars.contains(name.as_str()) => {
                    result.add_error(format!(
                        "{} {}: scalar binding '{}' is used before it is defined",
                        op.id(),
                        op.name,
                        name
                    ));
                }
                Input::WorkspacePath(file) if file.contains("..") || file.starts_with('/') => {
                    result.add_error(format!(
                        "{} {}: workspace file '{}' must stay inside the run directory",
                        op.id(),
                        op.name,
                        file
                    ));
                }
                _ => {}
            }
        }

        for name in op.effect.referenced_bindings() {
            if !handles.contains(name) {
                result.add_error(format!(
                    "{} {}: effect refers to unknown handle binding '{}'",
                    op.id(),
                    op.name,
                    name
                ));
            }
        }

        if let Some(output) = &op.output {
            let name = output.bind.as_str();
            if handles.contains(name) || scalars.contains(name) {
                result.add_warning(format!(
                    "{} {}: binding '{}' is rebound",
                    op.id(),
                    op.name,
                    name
                ));
            }
            match output.shape {
                OutputShape::Handle { .. } => {
                    scalars.remove(name);
                    handles.insert(name);
                }
                OutputShape::Scalar { .. } => {
                    handles.remove(name);
                    scalars.insert(name);
                }
            }
        }
    }
}

fn validate_operations(script: &Script, result: &mut ValidationResult) {
    for op in &script.operations {
        let label = format!("{} {}", op.id(), op.name);

        if op.name.trim().is_empty() {
            result.add_error(format!("{}: native function name cannot be empty", op.id()));
        }

        for kind in op.contract.listed_kinds() {
            if kind.is_fatal() {
                result.add_error(format!(
                    "{}: contract lists {}, which can never be expected or tolerated",
                    label, kind
                ));
            }
        }

        let handle_output = matches!(
            op.output.as_ref().map(|o| &o.shape),
            Some(OutputShape::Handle { .. })
        );
        if op.effect.needs_handle_output() && !handle_output {
            result.add_error(format!(
                "{}: effect {:?} needs a handle output binding",
                label, op.effect
            ));
        }
        if op.capability == Capability::Destroy && handle_output {
            result.add_error(format!("{}: destroy operations cannot bind a handle", label));
        }
        match &op.effect {
            Effect::Produce { .. } if op.capability != Capability::Create => {
                result.add_warning(format!(
                    "{}: produces an owned handle from a {:?} call",
                    label, op.capability
                ));
            }
            Effect::Release { .. } | Effect::DropReference { .. }
                if op.capability != Capability::Destroy =>
            {
                result.add_warning(format!(
                    "{}: releases a handle from a {:?} call",
                    label, op.capability
                ));
            }
            _ => {}
        }

        if op.timeout_ms == Some(0) {
            result.add_error(format!("{}: timeout_ms cannot be zero", label));
        }
        if op.expect.is_some() && op.contract.expects_failure() {
            result.add_warning(format!(
                "{}: predicate is ignored when the operation is expected to fail",
                label
            ));
        }
    }
}

fn validate_aggregation(script: &Script, result: &mut ValidationResult) {
    if script.expected_signature.is_some()
        && matches!(script.aggregation, AggregationMode::OrderedRecord)
    {
        result.add_error(
            "expected_signature requires folded_checksum aggregation".to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ErrorKind, Phase};
    use crate::core::script::{ErrorContract, Operation};
    use std::path::PathBuf;

    fn permissive() -> HarnessConfig {
        HarnessConfig {
            strict_mode: false,
            ..HarnessConfig::default()
        }
    }

    fn tree_script() -> Script {
        Script::new("tree", "cjson")
            .op(Operation::create(Phase::Configure, "cJSON_CreateObject")
                .bind_handle("root", "json.object")
                .owned())
            .op(Operation::destroy(Phase::Cleanup, "cJSON_Delete")
                .handle("root")
                .effect(Effect::release("root")))
    }

    #[test]
    fn test_valid_default_config() {
        let result = validate_config(&HarnessConfig::default()).unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = permissive();
        config.default_op_timeout_ms = 0;
        config.run_timeout_ms = Some(0);
        let result = validate_config(&config).unwrap();
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_strict_config_fails_fast() {
        let config = HarnessConfig {
            workspace_root: PathBuf::from("relative/dir"),
            ..HarnessConfig::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, HarnessError::Config(msg) if msg.contains("workspace_root")));
    }

    #[test]
    fn test_code_table_cannot_map_fatal_kind() {
        let mut config = permissive();
        let mut table = CodeTable::new("zlib-local", "zlib", SuccessRule::NonNegative);
        table.codes.insert(-9, ErrorKind::DoubleFree);
        config.code_tables.insert("zlib".to_string(), table);
        let result = validate_config(&config).unwrap();
        assert!(!result.is_valid());
    }

    #[test]
    fn test_valid_script() {
        let result = validate_script(&tree_script(), true).unwrap();
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_phase_order_must_not_go_backwards() {
        let script = tree_script().op(Operation::query(Phase::Operate, "cJSON_IsObject").handle("root"));
        let result = validate_script(&script, false).unwrap();
        assert!(result.errors.iter().any(|e| e.contains("backwards")));
    }

    #[test]
    fn test_binding_used_before_definition() {
        let script = Script::new("bad", "cjson")
            .op(Operation::query(Phase::Operate, "cJSON_GetArraySize").handle("missing"));
        let err = validate_script(&script, true).unwrap_err();
        assert!(matches!(err, HarnessError::Script(msg) if msg.contains("'missing'")));
    }

    #[test]
    fn test_fatal_kind_in_contract_rejected() {
        let mut script = tree_script();
        script.operations[1].contract = ErrorContract::expect_failure(&[ErrorKind::DoubleFree]);
        let result = validate_script(&script, false).unwrap();
        assert!(result.errors.iter().any(|e| e.contains("double_free")));
    }

    #[test]
    fn test_produce_needs_handle_output() {
        let script = Script::new("bad", "zlib")
            .op(Operation::create(Phase::Initialize, "deflateInit").owned());
        let result = validate_script(&script, false).unwrap();
        assert!(!result.is_valid());
    }

    #[test]
    fn test_signature_requires_folded_mode() {
        let script = tree_script().with_expected_signature(42);
        let result = validate_script(&script, false).unwrap();
        assert!(result.errors.iter().any(|e| e.contains("folded_checksum")));
    }
}
