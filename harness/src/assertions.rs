use std::fmt::Debug;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssertionError {
    #[error("response is not valid JSON: {0}")]
    NotJson(#[from] serde_json::Error),
    #[error("key '{path}' missing from {body}")]
    MissingField { path: String, body: String },
    #[error("key '{path}' is not a non-empty string, body: {body}")]
    NotAString { path: String, body: String },
    #[error("{} soft assertion(s) failed:\n{}", .0.len(), .0.join("\n"))]
    Soft(Vec<String>),
}

pub fn parse_json(bytes: &[u8]) -> Result<Value, AssertionError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Escape `.` and `*` so `segment` is matched literally by [`json_field`].
pub fn escape_path_segment(segment: &str) -> String {
    segment.replace('.', r"\.").replace('*', r"\*")
}

fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '.' => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

/// Look up a dotted path (`rooms.join.!abc\.def:hs.timeline`). Numeric
/// segments index into arrays.
pub fn json_field<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    split_path(path).iter().try_fold(body, |value, segment| match value {
        Value::Object(map) => map.get(segment.as_str()),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

pub fn json_field_str(body: &Value, path: &str) -> Result<String, AssertionError> {
    let field = json_field(body, path).ok_or_else(|| AssertionError::MissingField {
        path: path.to_string(),
        body: body.to_string(),
    })?;
    match field.as_str() {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(AssertionError::NotAString {
            path: path.to_string(),
            body: body.to_string(),
        }),
    }
}

/// Collects failures instead of stopping at the first one.
#[derive(Debug, Default)]
pub struct SoftAssertions {
    failures: Vec<String>,
}

impl SoftAssertions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, failure: impl Into<String>) {
        let failure = failure.into();
        tracing::warn!(%failure, "soft assertion failed");
        self.failures.push(failure);
    }

    /// Record `message` unless `condition` holds. Returns `condition`.
    pub fn check(&mut self, condition: bool, message: impl Into<String>) -> bool {
        if !condition {
            self.record(message);
        }
        condition
    }

    pub fn equal<T: PartialEq + Debug>(&mut self, actual: &T, expected: &T, what: &str) -> bool {
        self.check(
            actual == expected,
            format!("{what}: got {actual:?}, want {expected:?}"),
        )
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn finish(self) -> Result<(), AssertionError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(AssertionError::Soft(self.failures))
        }
    }
}
