use crate::config::types::{HarnessError, Result};
use crate::core::library::TargetLibrary;
use crate::targets::{json_tree::JsonTree, zstream::ZStream};

pub fn target_for(library: &str) -> Result<Box<dyn TargetLibrary>> {
    match library {
        "cjson" | "json" => Ok(Box::new(JsonTree::new())),
        "zlib" | "z" | "gzip" => Ok(Box::new(ZStream::new())),
        _ => Err(HarnessError::Config(format!(
            "unsupported target library: {library}"
        ))),
    }
}

/// Registry names with the version each model reports.
pub fn list_targets() -> Vec<(&'static str, &'static str)> {
    vec![
        (crate::targets::json_tree::LIBRARY_NAME, crate::targets::json_tree::VERSION),
        (crate::targets::zstream::LIBRARY_NAME, crate::targets::zstream::VERSION),
    ]
}
