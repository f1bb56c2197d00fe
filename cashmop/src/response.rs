//! JSON responses and exit codes
//!
//! Every command prints exactly one JSON document to stdout: the command's
//! payload with `"ok": true`, or `{"ok": false, "errors": [...]}`. Validation
//! failures exit with 2, everything else with 1.

use cashmop_core::ErrorKind;
use serde::Serialize;

/// Exit code for bad input.
pub const EXIT_VALIDATION: u8 = 2;
/// Exit code for failures while doing the work.
pub const EXIT_RUNTIME: u8 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// A failed command, ready to print.
#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub errors: Vec<ErrorDetail>,
}

impl CliError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_RUNTIME,
            errors: vec![ErrorDetail {
                message: message.into(),
                hint: None,
            }],
        }
    }
}

impl From<cashmop_core::Error> for CliError {
    fn from(err: cashmop_core::Error) -> Self {
        let code = match err.kind() {
            ErrorKind::Validation => EXIT_VALIDATION,
            ErrorKind::Runtime => EXIT_RUNTIME,
        };
        Self {
            code,
            errors: vec![ErrorDetail {
                message: err.to_string(),
                hint: err.hint().map(str::to_string),
            }],
        }
    }
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        // Keep the classification when a core error sits underneath the context
        let core = err
            .chain()
            .find_map(|e| e.downcast_ref::<cashmop_core::Error>());
        let code = match core.map(|e| e.kind()) {
            Some(ErrorKind::Validation) => EXIT_VALIDATION,
            _ => EXIT_RUNTIME,
        };
        let hint = core.and_then(|e| e.hint());
        Self {
            code,
            errors: vec![ErrorDetail {
                message: format!("{err:#}"),
                hint: hint.map(str::to_string),
            }],
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    ok: bool,
    errors: &'a [ErrorDetail],
}

/// Wrap a payload as `{"ok": true, ...payload}`.
#[derive(Serialize)]
pub struct Success<T: Serialize> {
    pub ok: bool,
    #[serde(flatten)]
    pub payload: T,
}

impl<T: Serialize> Success<T> {
    pub fn new(payload: T) -> Self {
        Self { ok: true, payload }
    }
}

pub fn print_success<T: Serialize>(payload: T) -> Result<(), CliError> {
    let body = serde_json::to_string_pretty(&Success::new(payload))
        .map_err(|e| CliError::runtime(format!("failed to encode response: {e}")))?;
    println!("{body}");
    Ok(())
}

pub fn print_error(err: &CliError) {
    let response = ErrorResponse {
        ok: false,
        errors: &err.errors,
    };
    match serde_json::to_string_pretty(&response) {
        Ok(body) => println!("{body}"),
        Err(_) => println!(r#"{{"ok":false,"errors":[{{"message":"failed to encode error"}}]}}"#),
    }
}
