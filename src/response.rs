use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Response is the error envelope the API attaches to non-success answers.
///
/// Decoding is best-effort: a body that is not JSON, or JSON that does not
/// match the envelope shape, yields an envelope with no errors rather than a
/// decode failure. Success bodies carry no envelope at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// HTTP status code the envelope was received with (not serialized)
    #[serde(skip)]
    pub status: u16,

    /// Structured errors reported by the API
    #[serde(rename = "_errors", default)]
    pub errors: Vec<ErrorEntry>,

    /// Server-side request id, for support tickets
    #[serde(rename = "_request_id", default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
}

/// A single `{code, message, details}` entry of the envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(default)]
    pub code: String,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Response {
    /// Decode the envelope from a raw body. Never fails.
    pub fn new(status: u16, body: &[u8]) -> Self {
        let mut response: Response = serde_json::from_slice(body).unwrap_or_default();
        response.status = status;
        response
    }

    /// True iff the server reported at least one error
    pub fn failed(&self) -> bool {
        !self.errors.is_empty()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[HTTP {}]", self.status)?;
        for (i, entry) in self.errors.iter().enumerate() {
            let text = entry.to_string();
            if i > 0 {
                f.write_str(" ||")?;
            }
            if !text.is_empty() {
                write!(f, " {}", text)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head: Vec<&str> = [self.code.trim(), self.message.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        let head = head.join(" ");
        let details = self.details.as_ref().map(render_details).unwrap_or_default();

        match (head.is_empty(), details.is_empty()) {
            (_, true) => f.write_str(&head),
            (true, false) => f.write_str(&details),
            (false, false) => write!(f, "{} - {}", head, details),
        }
    }
}

/// Render the free-form `details` value for humans
fn render_details(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .map(render_details)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(map) if map.is_empty() => String::new(),
        other => other.to_string(),
    }
}
