/// Native code tables
///
/// Versioned, immutable presets describing how each library reports status:
/// which integer codes mean success, what each failure code maps to, and how
/// a boolean `false` is read. Config files may override any preset.
use crate::config::types::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which integer return codes count as success
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessRule {
    /// Only 0 (errno style)
    Zero,
    /// Any code >= 0 (zlib, libpcap)
    NonNegative,
    /// Any code != 0 (libpng simplified API, C truthy)
    NonZero,
    /// An explicit set (sqlite OK/ROW/DONE)
    OneOf(Vec<i64>),
}

impl SuccessRule {
    pub fn is_success(&self, code: i64) -> bool {
        match self {
            SuccessRule::Zero => code == 0,
            SuccessRule::NonNegative => code >= 0,
            SuccessRule::NonZero => code != 0,
            SuccessRule::OneOf(codes) => codes.contains(&code),
        }
    }
}

/// Per-library code table
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodeTable {
    /// Preset ID (e.g. "zlib-v1")
    pub id: String,
    pub library: String,
    pub success: SuccessRule,
    /// Failure code to error kind
    #[serde(default)]
    pub codes: BTreeMap<i64, ErrorKind>,
    /// Symbolic names used in diagnostics
    #[serde(default)]
    pub names: BTreeMap<i64, String>,
    /// Kind reported when a boolean status is false
    #[serde(default)]
    pub bool_false: Option<ErrorKind>,
}

impl CodeTable {
    pub fn new(id: &str, library: &str, success: SuccessRule) -> Self {
        Self {
            id: id.to_string(),
            library: library.to_string(),
            success,
            codes: BTreeMap::new(),
            names: BTreeMap::new(),
            bool_false: None,
        }
    }

    fn code(mut self, code: i64, name: &str, kind: ErrorKind) -> Self {
        self.codes.insert(code, kind);
        self.names.insert(code, name.to_string());
        self
    }

    fn named(mut self, code: i64, name: &str) -> Self {
        self.names.insert(code, name.to_string());
        self
    }

    fn bool_false(mut self, kind: ErrorKind) -> Self {
        self.bool_false = Some(kind);
        self
    }

    /// Kind for a failure code, if the table maps it.
    pub fn lookup(&self, code: i64) -> Option<ErrorKind> {
        self.codes.get(&code).copied()
    }

    /// Diagnostic label for a code: symbolic name when known.
    pub fn describe(&self, code: i64) -> String {
        match self.names.get(&code) {
            Some(name) => format!("{} ({})", name, code),
            None => format!("code {}", code),
        }
    }

    /// Fallback table for libraries without a preset.
    pub fn generic(library: &str) -> Self {
        Self::new("generic-v1", library, SuccessRule::Zero)
    }
}

/// zlib-shaped stream/file library
pub fn zlib() -> CodeTable {
    CodeTable::new("zlib-v1", "zlib", SuccessRule::NonNegative)
        .named(0, "Z_OK")
        .named(1, "Z_STREAM_END")
        .named(2, "Z_NEED_DICT")
        .code(-1, "Z_ERRNO", ErrorKind::Unknown)
        .code(-2, "Z_STREAM_ERROR", ErrorKind::InvalidArgument)
        .code(-3, "Z_DATA_ERROR", ErrorKind::ParseFailure)
        .code(-4, "Z_MEM_ERROR", ErrorKind::AllocationFailure)
        .code(-5, "Z_BUF_ERROR", ErrorKind::InvalidArgument)
        .code(-6, "Z_VERSION_ERROR", ErrorKind::Unsupported)
}

/// Embedded database
pub fn sqlite() -> CodeTable {
    CodeTable::new("sqlite-v1", "sqlite", SuccessRule::OneOf(vec![0, 100, 101]))
        .named(0, "SQLITE_OK")
        .named(100, "SQLITE_ROW")
        .named(101, "SQLITE_DONE")
        .code(1, "SQLITE_ERROR", ErrorKind::InvalidArgument)
        .code(2, "SQLITE_INTERNAL", ErrorKind::Unknown)
        .code(3, "SQLITE_PERM", ErrorKind::Unsupported)
        .code(4, "SQLITE_ABORT", ErrorKind::Unknown)
        .code(5, "SQLITE_BUSY", ErrorKind::Timeout)
        .code(6, "SQLITE_LOCKED", ErrorKind::Timeout)
        .code(7, "SQLITE_NOMEM", ErrorKind::AllocationFailure)
        .code(8, "SQLITE_READONLY", ErrorKind::Unsupported)
        .code(11, "SQLITE_CORRUPT", ErrorKind::ParseFailure)
        .code(12, "SQLITE_NOTFOUND", ErrorKind::NotFound)
        .code(13, "SQLITE_FULL", ErrorKind::AllocationFailure)
        .code(14, "SQLITE_CANTOPEN", ErrorKind::NotFound)
        .code(20, "SQLITE_MISMATCH", ErrorKind::TypeMismatch)
        .code(21, "SQLITE_MISUSE", ErrorKind::InvalidArgument)
        .code(22, "SQLITE_NOLFS", ErrorKind::Unsupported)
        .code(25, "SQLITE_RANGE", ErrorKind::InvalidArgument)
        .code(26, "SQLITE_NOTADB", ErrorKind::ParseFailure)
}

/// Packet capture
pub fn pcap() -> CodeTable {
    CodeTable::new("pcap-v1", "pcap", SuccessRule::NonNegative)
        .code(-1, "PCAP_ERROR", ErrorKind::Unknown)
        .code(-2, "PCAP_ERROR_BREAK", ErrorKind::Unknown)
        .code(-3, "PCAP_ERROR_NOT_ACTIVATED", ErrorKind::InvalidArgument)
        .code(-4, "PCAP_ERROR_ACTIVATED", ErrorKind::InvalidArgument)
        .code(-5, "PCAP_ERROR_NO_SUCH_DEVICE", ErrorKind::NotFound)
        .code(-6, "PCAP_ERROR_RFMON_NOTSUP", ErrorKind::Unsupported)
        .code(-7, "PCAP_ERROR_NOT_RFMON", ErrorKind::InvalidArgument)
        .code(-8, "PCAP_ERROR_PERM_DENIED", ErrorKind::Unsupported)
        .code(-9, "PCAP_ERROR_IFACE_NOT_UP", ErrorKind::NotFound)
        .code(-10, "PCAP_ERROR_CANTSET_TSTAMP_TYPE", ErrorKind::Unsupported)
        .code(-11, "PCAP_ERROR_PROMISC_PERM_DENIED", ErrorKind::Unsupported)
        .code(-12, "PCAP_ERROR_TSTAMP_PRECISION_NOTSUP", ErrorKind::Unsupported)
}

/// Image codec (simplified API returns non-zero on success)
pub fn png() -> CodeTable {
    CodeTable::new("png-v1", "png", SuccessRule::NonZero).bool_false(ErrorKind::InvalidArgument)
}

/// Color management (cmsBool results)
pub fn lcms() -> CodeTable {
    CodeTable::new("lcms-v1", "lcms", SuccessRule::NonZero).bool_false(ErrorKind::InvalidArgument)
}

/// Regex engine (C binding error codes)
pub fn re2() -> CodeTable {
    let mut table = CodeTable::new("re2-v1", "re2", SuccessRule::Zero)
        .named(0, "NoError")
        .code(1, "ErrorInternal", ErrorKind::Unknown);
    let parse_errors = [
        (2, "ErrorBadEscape"),
        (3, "ErrorBadCharClass"),
        (4, "ErrorBadCharRange"),
        (5, "ErrorMissingBracket"),
        (6, "ErrorMissingParen"),
        (7, "ErrorTrailingBackslash"),
        (8, "ErrorRepeatArgument"),
        (9, "ErrorRepeatSize"),
        (10, "ErrorRepeatOp"),
        (11, "ErrorBadPerlOp"),
        (12, "ErrorBadUTF8"),
        (13, "ErrorBadNamedCapture"),
    ];
    for (code, name) in parse_errors {
        table = table.code(code, name, ErrorKind::ParseFailure);
    }
    table.code(14, "ErrorPatternTooLarge", ErrorKind::Unsupported)
}

/// JSON tree library (cJSON_bool results)
pub fn cjson() -> CodeTable {
    CodeTable::new("cjson-v1", "cjson", SuccessRule::NonZero).bool_false(ErrorKind::InvalidArgument)
}

/// Built-in table for a library name, if one exists.
pub fn preset_for(library: &str) -> Option<CodeTable> {
    match library {
        "zlib" | "z" => Some(zlib()),
        "sqlite" | "sqlite3" => Some(sqlite()),
        "pcap" | "libpcap" => Some(pcap()),
        "png" | "libpng" => Some(png()),
        "lcms" | "lcms2" => Some(lcms()),
        "re2" | "cre2" => Some(re2()),
        "cjson" | "json" => Some(cjson()),
        _ => None,
    }
}

/// Names of all built-in presets
pub fn list_presets() -> Vec<&'static str> {
    vec!["cjson", "lcms", "pcap", "png", "re2", "sqlite", "zlib"]
}
