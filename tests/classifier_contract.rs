//! Error classification and contract acceptance through full runs

use seqbox::config::config::HarnessConfig;
use seqbox::config::presets::{preset_for, CodeTable};
use seqbox::config::types::{ErrorKind, Phase, RunOutcome};
use seqbox::config::validator::validate_script;
use seqbox::core::script::{Capability, Effect, ErrorContract, Operation, Predicate, Script};
use seqbox::core::types::{RawSignal, Value, ValueType};
use seqbox::exec::executor::PhaseExecutor;
use seqbox::targets::json_tree::JsonTree;
use seqbox::targets::zstream::ZStream;
use seqbox::verdict::classifier::{Classification, ErrorClassifier, ExpectedShape};
use seqbox::verdict::record::Observed;
use tempfile::TempDir;

fn executor(dir: &TempDir) -> PhaseExecutor {
    PhaseExecutor::new(HarnessConfig::default().with_workspace_root(dir.path().to_path_buf()))
        .unwrap()
}

fn classify(table: &CodeTable, capability: Capability, raw: RawSignal) -> Option<ErrorKind> {
    let shape = ExpectedShape::new(capability, "call", table);
    ErrorClassifier::classify(&raw, &shape).kind()
}

#[test]
fn test_zlib_codes_map_to_taxonomy() {
    let table = preset_for("zlib").unwrap();
    let cases = [
        (0, None),
        (1, None),
        (2, None),
        (-1, Some(ErrorKind::Unknown)),
        (-2, Some(ErrorKind::InvalidArgument)),
        (-3, Some(ErrorKind::ParseFailure)),
        (-4, Some(ErrorKind::AllocationFailure)),
        (-5, Some(ErrorKind::InvalidArgument)),
        (-6, Some(ErrorKind::Unsupported)),
        (-42, Some(ErrorKind::Unknown)),
    ];
    for (code, expected) in cases {
        assert_eq!(
            classify(&table, Capability::Mutate, RawSignal::Code(code)),
            expected,
            "code {}",
            code
        );
    }
}

#[test]
fn test_null_results_by_capability() {
    let table = preset_for("cjson").unwrap();
    assert_eq!(
        classify(&table, Capability::Create, RawSignal::null()),
        Some(ErrorKind::AllocationFailure)
    );
    assert_eq!(
        classify(&table, Capability::Query, RawSignal::null()),
        Some(ErrorKind::NotFound)
    );
    assert_eq!(
        classify(&table, Capability::Mutate, RawSignal::Bool(false)),
        Some(ErrorKind::InvalidArgument)
    );
    assert_eq!(
        classify(
            &table,
            Capability::Create,
            RawSignal::ParseError {
                offset: 3,
                message: "bad".to_string()
            }
        ),
        Some(ErrorKind::ParseFailure)
    );
}

#[test]
fn test_value_where_handle_expected_is_type_mismatch() {
    let table = preset_for("cjson").unwrap();
    let kind = seqbox::core::types::HandleKind::new("json.object");
    let shape = ExpectedShape::new(Capability::Query, "cJSON_GetArraySize", &table)
        .with_handle_kind(Some(&kind));
    let result = ErrorClassifier::classify(&RawSignal::Value(Value::Int(1)), &shape);
    assert!(matches!(
        result,
        Classification::Failure {
            kind: ErrorKind::TypeMismatch,
            ..
        }
    ));
}

#[test]
fn test_fatal_kinds_cannot_be_declared() {
    for kind in [ErrorKind::DoubleFree, ErrorKind::Leak, ErrorKind::DanglingReference] {
        let script = Script::new("fatal", "cjson")
            .op(Operation::create(Phase::Configure, "cJSON_CreateNull")
                .bind_handle("n", "json.null")
                .owned())
            .op(Operation::destroy(Phase::Operate, "cJSON_Delete")
                .handle("n")
                .effect(Effect::release("n"))
                .contract(ErrorContract::tolerate(&[kind])));
        assert!(validate_script(&script, true).is_err(), "{:?}", kind);
        assert!(!ErrorContract::tolerate(&[kind]).accepts(kind));
        assert!(!ErrorContract::expect_failure(&[kind]).accepts(kind));
        assert!(!ErrorContract::Discard.accepts(kind));
    }
}

#[test]
fn test_empty_tolerate_accepts_only_recoverable_kinds() {
    let contract = ErrorContract::tolerate(&[]);
    assert!(contract.accepts(ErrorKind::NotFound));
    assert!(contract.accepts(ErrorKind::ParseFailure));
    assert!(contract.accepts(ErrorKind::Unsupported));
    assert!(!contract.accepts(ErrorKind::InvalidArgument));
    assert!(!contract.accepts(ErrorKind::Timeout));
}

#[test]
fn test_discarded_failure_is_still_recorded() {
    let dir = TempDir::new().unwrap();
    let script = Script::new("discard", "zlib")
        .op(Operation::query(Phase::Operate, "uncompress")
            .literal(vec![0x78u8, 0x01, 0x07])
            .discard())
        .op(Operation::query(Phase::Validate, "zlibVersion")
            .bind_scalar("v", Some(ValueType::Text))
            .expect(Predicate::Equals(Value::Text("1.3.1".to_string()))));
    let report = executor(&dir).execute(&script, Box::new(ZStream::new())).unwrap();

    assert!(report.is_success(), "{:?}", report.errors);
    let first = &report.record.entries[0];
    assert!(matches!(
        first.observed,
        Observed::Error {
            kind: ErrorKind::ParseFailure,
            ..
        }
    ));
    assert_eq!(report.record.len(), 2);
}

#[test]
fn test_expected_failure_that_succeeds_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let script = Script::new("unexpected-success", "cjson").op(
        Operation::create(Phase::Operate, "cJSON_Parse")
            .literal("[1, 2]")
            .bind_handle("doc", "json.array")
            .owned()
            .contract(ErrorContract::expect_failure(&[ErrorKind::ParseFailure])),
    );
    let report = executor(&dir)
        .execute(&script, Box::new(JsonTree::new()))
        .unwrap();
    assert_eq!(report.outcome(), RunOutcome::Failure);
    assert_eq!(report.error().unwrap().kind, ErrorKind::Unknown);
    assert!(report.leaked.is_empty());
}

#[test]
fn test_wrong_failure_kind_is_not_accepted() {
    let dir = TempDir::new().unwrap();
    let script = Script::new("wrong-kind", "zlib")
        .op(Operation::create(Phase::Configure, "deflateInit")
            .literal(42)
            .bind_handle("strm", "z.stream")
            .owned()
            .contract(ErrorContract::expect_failure(&[ErrorKind::AllocationFailure])));
    let report = executor(&dir).execute(&script, Box::new(ZStream::new())).unwrap();
    let error = report.error().unwrap();
    assert_eq!(error.kind, ErrorKind::InvalidArgument);
    assert_eq!(error.raw, Some(RawSignal::Code(-2)));
}

#[test]
fn test_code_table_override_from_config() {
    let dir = TempDir::new().unwrap();
    let mut config = HarnessConfig::default().with_workspace_root(dir.path().to_path_buf());
    let mut table = preset_for("zlib").unwrap();
    table.codes.insert(-2, ErrorKind::Unsupported);
    config.code_tables.insert("zlib".to_string(), table);

    let script = Script::new("override", "zlib").op(
        Operation::create(Phase::Configure, "deflateInit")
            .literal(42)
            .bind_handle("strm", "z.stream")
            .owned()
            .contract(ErrorContract::tolerate(&[])),
    );
    let report = PhaseExecutor::new(config)
        .unwrap()
        .execute(&script, Box::new(ZStream::new()))
        .unwrap();
    assert!(report.is_success(), "{:?}", report.errors);
}
