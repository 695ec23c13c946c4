/// Built-in scenario scripts
///
/// Each scenario is a plain [`Script`] plus the outcome it is expected to
/// reach. The CLI, the integration tests and the latency benchmark all run
/// the same set.
use crate::config::config::HarnessConfig;
use crate::config::types::{ErrorKind, HarnessError, Phase, Result, RunOutcome};
use crate::core::script::{Effect, ErrorContract, Operation, Predicate, Script};
use crate::core::types::{Value, ValueType};
use crate::exec::executor::{PhaseExecutor, RunReport};
use crate::targets::registry::target_for;
use crate::verdict::record::{AggregationMode, FoldOp, FoldWidth};
use log::{debug, info};
use std::thread;

/// Payload written and read back by the gzip scenario.
pub const GZIP_PAYLOAD: &str = "seqbox gzip round trip";

/// Folded XOR of `crc32("a")`, `crc32("b")` and `adler32(1, "abc")`.
pub const FOLDED_SIGNATURE: u64 = 0xe8b7_be43 ^ 0x71be_eff9 ^ 0x024d_0127;

#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub script: Script,
    pub expected: RunOutcome,
    /// Error kind of the first failure, when a failure is expected
    pub expected_error: Option<ErrorKind>,
}

impl Scenario {
    fn passing(name: &'static str, description: &'static str, script: Script) -> Self {
        Self {
            name,
            description,
            script,
            expected: RunOutcome::Success,
            expected_error: None,
        }
    }

    /// Whether a report matches what this scenario expects.
    pub fn matches(&self, report: &RunReport) -> bool {
        report.outcome() == self.expected
            && report.error().map(|e| e.kind) == self.expected_error
            && report.leaked.is_empty()
    }
}

/// Move a child between roots, then delete the original root.
pub fn reparent_then_release() -> Script {
    Script::new("reparent-then-release", "cjson")
        .op(Operation::create(Phase::Configure, "cJSON_CreateObject")
            .bind_handle("root", "json.object")
            .owned())
        .op(Operation::create(Phase::Configure, "cJSON_CreateArray")
            .bind_handle("child", "json.array")
            .owned())
        .op(Operation::create(Phase::Configure, "cJSON_CreateObject")
            .bind_handle("new_root", "json.object")
            .owned())
        .op(Operation::mutate(Phase::Operate, "cJSON_AddItemToObject")
            .handle("root")
            .literal("items")
            .handle("child")
            .effect(Effect::attach("child", "root"))
            .expect(Predicate::Truthy))
        .op(Operation::mutate(Phase::Operate, "cJSON_DetachItemFromObject")
            .handle("root")
            .literal("items")
            .bind_handle("detached", "json.array")
            .effect(Effect::detach_output("root")))
        .op(Operation::mutate(Phase::Operate, "cJSON_AddItemToObject")
            .handle("new_root")
            .literal("items")
            .handle("detached")
            .effect(Effect::attach("detached", "new_root"))
            .expect(Predicate::Truthy))
        .op(Operation::query(Phase::Operate, "cJSON_GetArraySize")
            .handle("root")
            .expect(Predicate::Equals(Value::Int(0))))
        .op(Operation::destroy(Phase::Operate, "cJSON_Delete")
            .handle("root")
            .effect(Effect::release("root")))
        .op(Operation::query(Phase::Validate, "cJSON_GetArraySize")
            .handle("new_root")
            .expect(Predicate::Equals(Value::Int(1))))
}

/// One number owned by X and referenced from Y; Y goes first, then X.
pub fn shared_reference() -> Script {
    Script::new("shared-reference", "cjson")
        .op(Operation::create(Phase::Configure, "cJSON_CreateArray")
            .bind_handle("x", "json.array")
            .owned())
        .op(Operation::create(Phase::Configure, "cJSON_CreateArray")
            .bind_handle("y", "json.array")
            .owned())
        .op(Operation::create(Phase::Configure, "cJSON_CreateNumber")
            .literal(42.0)
            .bind_handle("n", "json.number")
            .owned())
        .op(Operation::mutate(Phase::Operate, "cJSON_AddItemToArray")
            .handle("x")
            .handle("n")
            .effect(Effect::attach("n", "x"))
            .expect(Predicate::Truthy))
        .op(Operation::mutate(Phase::Operate, "cJSON_AddItemReferenceToArray")
            .handle("y")
            .handle("n")
            .effect(Effect::attach_reference("n", "y"))
            .expect(Predicate::Truthy))
        .op(Operation::destroy(Phase::Operate, "cJSON_Delete")
            .handle("y")
            .effect(Effect::release("y")))
        .op(Operation::query(Phase::Validate, "cJSON_GetArrayItem")
            .handle("x")
            .literal(0)
            .bind_handle("found", "json.number"))
        .op(Operation::query(Phase::Validate, "cJSON_GetNumberValue")
            .handle("found")
            .expect(Predicate::Equals(Value::Float(42.0))))
        .op(Operation::destroy(Phase::Cleanup, "cJSON_Delete")
            .handle("x")
            .effect(Effect::release("x")))
}

/// Parse of malformed text fails the run without leaking what came before.
pub fn malformed_parse() -> Script {
    Script::new("malformed-parse", "cjson")
        .op(Operation::create(Phase::Configure, "cJSON_CreateObject")
            .bind_handle("scratch", "json.object")
            .owned())
        .op(Operation::create(Phase::Operate, "cJSON_Parse")
            .literal("{\"a\": [1, 2,, 3]}")
            .bind_handle("doc", "json")
            .owned())
        .op(Operation::query(Phase::Validate, "cJSON_GetArraySize")
            .handle("doc"))
}

/// Build a document, print it, reparse the text and compare.
pub fn json_round_trip() -> Script {
    Script::new("json-round-trip", "cjson")
        .op(Operation::create(Phase::Configure, "cJSON_CreateObject")
            .bind_handle("root", "json.object")
            .owned())
        .op(Operation::create(Phase::Configure, "cJSON_CreateString")
            .literal("seqbox")
            .bind_handle("name", "json.string")
            .owned())
        .op(Operation::create(Phase::Configure, "cJSON_CreateArray")
            .bind_handle("sizes", "json.array")
            .owned())
        .op(Operation::create(Phase::Configure, "cJSON_CreateNumber")
            .literal(1.0)
            .bind_handle("one", "json.number")
            .owned())
        .op(Operation::create(Phase::Configure, "cJSON_CreateNumber")
            .literal(2.5)
            .bind_handle("two", "json.number")
            .owned())
        .op(Operation::mutate(Phase::Operate, "cJSON_AddItemToObject")
            .handle("root")
            .literal("name")
            .handle("name")
            .effect(Effect::attach("name", "root"))
            .expect(Predicate::Truthy))
        .op(Operation::mutate(Phase::Operate, "cJSON_AddItemToArray")
            .handle("sizes")
            .handle("one")
            .effect(Effect::attach("one", "sizes"))
            .expect(Predicate::Truthy))
        .op(Operation::mutate(Phase::Operate, "cJSON_AddItemToArray")
            .handle("sizes")
            .handle("two")
            .effect(Effect::attach("two", "sizes"))
            .expect(Predicate::Truthy))
        .op(Operation::mutate(Phase::Operate, "cJSON_AddItemToObject")
            .handle("root")
            .literal("sizes")
            .handle("sizes")
            .effect(Effect::attach("sizes", "root"))
            .expect(Predicate::Truthy))
        .op(Operation::query(Phase::Operate, "cJSON_PrintUnformatted")
            .handle("root")
            .bind_scalar("text", Some(ValueType::Text))
            .expect(Predicate::Equals(Value::Text(
                "{\"name\":\"seqbox\",\"sizes\":[1,2.5]}".to_string(),
            ))))
        .op(Operation::create(Phase::Operate, "cJSON_Parse")
            .scalar("text")
            .bind_handle("copy", "json.object")
            .owned())
        .op(Operation::query(Phase::Validate, "cJSON_Compare")
            .handle("root")
            .handle("copy")
            .literal(true)
            .expect(Predicate::Truthy))
        .op(Operation::query(Phase::Validate, "cJSON_GetArraySize")
            .handle("copy")
            .expect(Predicate::Equals(Value::Int(2))))
}

/// Write a gzip member into the run workspace and read it back.
pub fn gzip_round_trip() -> Script {
    Script::new("gzip-round-trip", "zlib")
        .op(Operation::create(Phase::Configure, "gzopen")
            .workspace_path("payload.gz")
            .literal("wb")
            .bind_handle("out", "z.gzfile")
            .owned())
        .op(Operation::mutate(Phase::Operate, "gzwrite")
            .handle("out")
            .literal(GZIP_PAYLOAD)
            .expect(Predicate::Equals(Value::Int(GZIP_PAYLOAD.len() as i64))))
        .op(Operation::destroy(Phase::Operate, "gzclose")
            .handle("out")
            .effect(Effect::release("out")))
        .op(Operation::create(Phase::Operate, "gzopen")
            .workspace_path("payload.gz")
            .literal("rb")
            .bind_handle("in", "z.gzfile")
            .owned())
        .op(Operation::query(Phase::Validate, "gzread")
            .handle("in")
            .literal(4096)
            .bind_scalar("data", Some(ValueType::Bytes))
            .expect(Predicate::Equals(Value::Bytes(GZIP_PAYLOAD.as_bytes().to_vec()))))
        .op(Operation::query(Phase::Validate, "crc32")
            .literal(0)
            .scalar("data")
            .record())
        .op(Operation::destroy(Phase::Cleanup, "gzclose")
            .handle("in")
            .effect(Effect::release("in")))
}

/// Ending an inflate stream with `deflateEnd`; cleanup uses `inflateEnd`.
pub fn mismatched_destructor() -> Script {
    Script::new("mismatched-destructor", "zlib")
        .op(Operation::create(Phase::Configure, "inflateInit")
            .bind_handle("strm", "z.stream")
            .owned())
        .op(Operation::destroy(Phase::Operate, "deflateEnd")
            .handle("strm")
            .effect(Effect::release("strm"))
            .contract(ErrorContract::expect_failure(&[ErrorKind::InvalidArgument])))
        .op(Operation::query(Phase::Validate, "zlibVersion")
            .bind_scalar("version", Some(ValueType::Text))
            .record())
}

/// Checksums folded into one 32-bit XOR signature.
pub fn folded_checksum() -> Script {
    Script::new("folded-checksum", "zlib")
        .with_aggregation(AggregationMode::FoldedChecksum {
            op: FoldOp::Xor,
            width: FoldWidth::W32,
        })
        .with_expected_signature(FOLDED_SIGNATURE)
        .op(Operation::query(Phase::Operate, "crc32")
            .literal(0)
            .literal("a")
            .record())
        .op(Operation::query(Phase::Operate, "crc32")
            .literal(0)
            .literal("b")
            .record())
        .op(Operation::query(Phase::Validate, "adler32")
            .literal(1)
            .literal("abc")
            .record())
}

/// All built-in scenarios, in a stable order.
pub fn builtin() -> Vec<Scenario> {
    vec![
        Scenario::passing(
            "reparent-then-release",
            "attach, detach, re-attach, then delete the original root",
            reparent_then_release(),
        ),
        Scenario::passing(
            "shared-reference",
            "owned by one object, referenced by another, freed once",
            shared_reference(),
        ),
        Scenario {
            name: "malformed-parse",
            description: "parse failure ends the run with nothing leaked",
            script: malformed_parse(),
            expected: RunOutcome::Failure,
            expected_error: Some(ErrorKind::ParseFailure),
        },
        Scenario::passing(
            "json-round-trip",
            "print, reparse and compare a document",
            json_round_trip(),
        ),
        Scenario::passing(
            "gzip-round-trip",
            "gzip member written and read back in the run workspace",
            gzip_round_trip(),
        ),
        Scenario::passing(
            "mismatched-destructor",
            "wrong end call is expected to fail; teardown uses the right one",
            mismatched_destructor(),
        ),
        Scenario::passing(
            "folded-checksum",
            "checksums folded into a fixed-width signature",
            folded_checksum(),
        ),
    ]
}

pub fn find(name: &str) -> Result<Scenario> {
    builtin()
        .into_iter()
        .find(|s| s.name == name)
        .ok_or_else(|| HarnessError::Config(format!("unknown scenario: {}", name)))
}

/// Run one script against a fresh instance of its registered target.
pub fn run_script(config: &HarnessConfig, script: &Script) -> Result<RunReport> {
    let library = target_for(&script.library)?;
    let executor = PhaseExecutor::new(config.clone())?;
    executor.execute(script, library)
}

/// Run scripts on separate threads, each with its own executor and target.
///
/// Reports come back in input order.
pub fn run_concurrently(config: &HarnessConfig, scripts: &[Script]) -> Result<Vec<RunReport>> {
    info!("running {} scripts concurrently", scripts.len());
    thread::scope(|scope| {
        let workers: Vec<_> = scripts
            .iter()
            .map(|script| scope.spawn(move || run_script(config, script)))
            .collect();
        workers
            .into_iter()
            .map(|worker| {
                worker.join().unwrap_or_else(|_| {
                    Err(HarnessError::Config("scenario worker panicked".to_string()))
                })
            })
            .collect()
    })
}

/// Summary line per scenario: name, whether it matched, and the report.
pub fn run_all(config: &HarnessConfig) -> Result<Vec<(Scenario, bool, RunReport)>> {
    let mut results = Vec::new();
    for scenario in builtin() {
        let report = run_script(config, &scenario.script)?;
        let matched = scenario.matches(&report);
        debug!(
            "scenario {}: {:?} (matched: {})",
            scenario.name,
            report.outcome(),
            matched
        );
        results.push((scenario, matched, report));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::validator::validate_script;

    #[test]
    fn test_builtin_scripts_validate_strictly() {
        for scenario in builtin() {
            let result = validate_script(&scenario.script, true)
                .unwrap_or_else(|e| panic!("{}: {}", scenario.name, e));
            assert!(result.warnings.is_empty(), "{}: {:?}", scenario.name, result.warnings);
        }
    }

    #[test]
    fn test_builtin_names_are_unique() {
        let mut names: Vec<_> = builtin().iter().map(|s| s.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), builtin().len());
    }

    #[test]
    fn test_scripts_survive_json() {
        let script = shared_reference();
        let text = script.to_json_pretty().unwrap();
        assert_eq!(Script::from_json(&text).unwrap(), script);
    }

    #[test]
    fn test_find_unknown_scenario() {
        assert!(find("nope").is_err());
        assert_eq!(find("folded-checksum").unwrap().name, "folded-checksum");
    }
}
