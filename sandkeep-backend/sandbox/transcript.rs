//! Turning raw interpreter output into an `ExecutionTranscript`.

use crate::sandbox::types::{CellResult, ExecutionError, ExecutionTranscript, transcript_lines};

/// Build the transcript of a script run by a plain interpreter process.
///
/// A non-zero exit sets `error`, named after the exception on the last
/// stderr line (`NameError: name 'x' is not defined`) or `RuntimeError`
/// when none can be found. Trimmed stdout becomes the single text result.
pub fn from_process_output(stdout: &str, stderr: &str, exit_code: i64) -> ExecutionTranscript {
    let trimmed = stdout.trim();
    let results = if trimmed.is_empty() {
        vec![]
    } else {
        vec![CellResult::text(trimmed)]
    };

    let error = (exit_code != 0).then(|| {
        let (name, value) = exception_from_stderr(stderr)
            .unwrap_or_else(|| ("RuntimeError".to_string(), fallback_value(stderr, exit_code)));
        ExecutionError {
            name,
            value,
            traceback: stderr.to_string(),
        }
    });

    ExecutionTranscript {
        stdout: transcript_lines(stdout),
        stderr: transcript_lines(stderr),
        error,
        results,
    }
}

fn exception_from_stderr(stderr: &str) -> Option<(String, String)> {
    let last = stderr.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    let (name, value) = match last.split_once(':') {
        Some((name, value)) => (name.trim(), value.trim()),
        None => (last, ""),
    };
    is_exception_name(name).then(|| (name.to_string(), value.to_string()))
}

/// `ValueError`, `json.decoder.JSONDecodeError`, `KeyboardInterrupt`.
fn is_exception_name(name: &str) -> bool {
    let Some(short) = name.rsplit('.').next() else {
        return false;
    };
    !name.is_empty()
        && name
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        && short.starts_with(|c: char| c.is_ascii_uppercase())
}

fn fallback_value(stderr: &str, exit_code: i64) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("process exited with code {exit_code}"))
}
