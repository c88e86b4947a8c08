//! Import allow-listing and the built-in module library.
//!
//! Imports are checked textually before the script runs, so a disallowed
//! module never gets as far as the interpreter.

use std::sync::LazyLock;

use regex::Regex;
use rhai::{module_resolvers::StaticModuleResolver, Array, Dynamic, EvalAltResult, ImmutableString, Module};

use loom_contracts::error::{LoomError, LoomResult};

use crate::convert::{to_dynamic, to_plain_json};
use crate::host::script_error;

/// Name recorded for imports whose path is not a string literal.
const DYNAMIC_IMPORT: &str = "<dynamic>";

static IMPORT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bimport\b(?:\s*"([^"]*)")?"#).expect("import pattern is valid"));

/// Every module name `code` imports. Non-literal imports are reported as
/// `<dynamic>`.
pub fn imported_modules(code: &str) -> Vec<String> {
    IMPORT_PATTERN
        .captures_iter(code)
        .map(|c| {
            c.get(1)
                .map_or_else(|| DYNAMIC_IMPORT.to_string(), |m| m.as_str().to_string())
        })
        .collect()
}

/// Reject the first import outside `allowed`.
pub fn check_imports(code: &str, allowed: &[String]) -> LoomResult<()> {
    match imported_modules(code)
        .into_iter()
        .find(|m| !allowed.iter().any(|a| a == m))
    {
        Some(module) => Err(LoomError::UnsupportedModule { module }),
        None => Ok(()),
    }
}

fn json_module() -> Module {
    let mut module = Module::new();
    module.set_native_fn("parse", |text: &str| -> Result<Dynamic, Box<EvalAltResult>> {
        serde_json::from_str(text)
            .map(to_dynamic)
            .map_err(|e| script_error("SyntaxError", e.to_string()))
    });
    module.set_native_fn("stringify", |value: Dynamic| -> Result<ImmutableString, Box<EvalAltResult>> {
        Ok(to_plain_json(value).to_string().into())
    });
    module
}

fn text_module() -> Module {
    let mut module = Module::new();
    module.set_native_fn("words", |text: &str| -> Result<Array, Box<EvalAltResult>> {
        Ok(text
            .split_whitespace()
            .map(|w| Dynamic::from(ImmutableString::from(w)))
            .collect())
    });
    module.set_native_fn("lines", |text: &str| -> Result<Array, Box<EvalAltResult>> {
        Ok(text
            .lines()
            .map(|l| Dynamic::from(ImmutableString::from(l)))
            .collect())
    });
    module.set_native_fn("capitalize", |text: &str| -> Result<ImmutableString, Box<EvalAltResult>> {
        let mut chars = text.chars();
        Ok(match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect::<String>().into(),
            None => ImmutableString::new(),
        })
    });
    module
}

/// A resolver serving the allowed subset of the built-in modules.
pub(crate) fn resolver(allowed: &[String]) -> StaticModuleResolver {
    let mut resolver = StaticModuleResolver::new();
    for name in allowed {
        let module = match name.as_str() {
            "json" => json_module(),
            "text" => text_module(),
            _ => continue,
        };
        resolver.insert(name.as_str(), module);
    }
    resolver
}
