//! Mapping interpreter failures onto `LoomError`.

use rhai::{Dynamic, EvalAltResult, ImmutableString, Map, ParseError};

use loom_contracts::error::{LoomError, ScriptFault};

use crate::{
    host::{HostFailure, HOST_GONE},
    limits::{SandboxLimits, DEADLINE_TOKEN},
};

const MAX_CAUSE_DEPTH: usize = 8;

/// Build a fault from a thrown value.
///
/// Maps with `name`/`message`/`cause` keep their shape; anything else
/// becomes an `Error` whose message is the value's text.
fn fault_from_value(value: &Dynamic, depth: usize) -> ScriptFault {
    let Some(map) = value.read_lock::<Map>() else {
        let message = value
            .read_lock::<ImmutableString>()
            .map(|s| s.to_string())
            .unwrap_or_else(|| value.to_string());
        return ScriptFault::new("Error", message);
    };

    let text = |key: &str| {
        map.get(key)
            .filter(|v| !v.is_unit())
            .map(|v| v.to_string())
    };
    let fault = ScriptFault::new(
        text("name").unwrap_or_else(|| "Error".to_string()),
        text("message").unwrap_or_default(),
    );
    match map.get("cause").filter(|c| !c.is_unit()) {
        Some(cause) if depth < MAX_CAUSE_DEPTH => fault.with_cause(fault_from_value(cause, depth + 1)),
        _ => fault,
    }
}

/// Strip function-call and module wrappers down to the failure itself.
fn root_cause(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) | EvalAltResult::ErrorInModule(_, inner, _) => {
            root_cause(inner)
        }
        other => other,
    }
}

pub(crate) fn from_parse_error(err: &ParseError) -> LoomError {
    LoomError::Script(ScriptFault::new("SyntaxError", err.to_string()))
}

pub(crate) fn from_eval_error(err: &EvalAltResult, limits: &SandboxLimits) -> LoomError {
    let memory = || LoomError::ResourceExceeded {
        resource: "memory".to_string(),
        limit: format!("{} bytes", limits.memory_limit_bytes),
    };

    match root_cause(err) {
        EvalAltResult::ErrorRuntime(value, _) => LoomError::Script(fault_from_value(value, 0)),

        EvalAltResult::ErrorTerminated(token, _) => {
            if let Some(failure) = token.read_lock::<HostFailure>() {
                return failure.0.clone();
            }
            let token = token.to_string();
            if token == DEADLINE_TOKEN {
                LoomError::ResourceExceeded {
                    resource: "time".to_string(),
                    limit: format!("{}ms", limits.deadline.as_millis()),
                }
            } else if token == HOST_GONE {
                LoomError::Cancelled
            } else {
                LoomError::Script(ScriptFault::new("Terminated", token))
            }
        }

        EvalAltResult::ErrorTooManyOperations(_) => LoomError::ResourceExceeded {
            resource: "operations".to_string(),
            limit: limits.max_operations.to_string(),
        },

        EvalAltResult::ErrorDataTooLarge(..)
        | EvalAltResult::ErrorStackOverflow(_)
        | EvalAltResult::ErrorTooManyModules(_) => memory(),

        EvalAltResult::ErrorModuleNotFound(module, _) => LoomError::UnsupportedModule {
            module: module.clone(),
        },

        EvalAltResult::ErrorFunctionNotFound(..) | EvalAltResult::ErrorVariableNotFound(..) => {
            LoomError::Script(ScriptFault::new("ReferenceError", err.to_string()))
        }

        EvalAltResult::ErrorMismatchDataType(..) | EvalAltResult::ErrorMismatchOutputType(..) => {
            LoomError::Script(ScriptFault::new("TypeError", err.to_string()))
        }

        EvalAltResult::ErrorParsing(..) => LoomError::Script(ScriptFault::new("SyntaxError", err.to_string())),

        other => LoomError::Script(ScriptFault::new("Error", other.to_string())),
    }
}
