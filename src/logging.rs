use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::context::Context;
use crate::error::ScmError;

/// Verbosity of the client's own request logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Nothing is logged
    Quiet,
    /// One line per request attempt
    #[default]
    Basic,
    /// Full request/response dumps
    Detailed,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Quiet => "quiet",
            LogLevel::Basic => "basic",
            LogLevel::Detailed => "detailed",
        }
    }

    /// True if a message at `level` should be emitted under `self`
    pub fn allows(&self, level: LogLevel) -> bool {
        *self != LogLevel::Quiet && level <= *self
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ScmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quiet" => Ok(LogLevel::Quiet),
            "basic" => Ok(LogLevel::Basic),
            "detailed" => Ok(LogLevel::Detailed),
            other => Err(ScmError::Config(format!("unknown logging level {:?}", other))),
        }
    }
}

/// Destination for the client's request logs.
///
/// The context is passed through so host applications can correlate lines
/// with their own request traces.
pub trait LogSink: Send + Sync {
    fn log(&self, ctx: &Context, level: LogLevel, message: &str);
}

/// Default sink: forwards to the `log` facade under the `scm` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdLogSink;

impl LogSink for StdLogSink {
    fn log(&self, ctx: &Context, level: LogLevel, message: &str) {
        match level {
            LogLevel::Quiet => {}
            LogLevel::Basic => log::info!(target: "scm", "[{}] {}", ctx.trace_id(), message),
            LogLevel::Detailed => log::debug!(target: "scm", "[{}] {}", ctx.trace_id(), message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!("quiet".parse::<LogLevel>().unwrap(), LogLevel::Quiet);
        assert_eq!(" Basic ".parse::<LogLevel>().unwrap(), LogLevel::Basic);
        assert_eq!("DETAILED".parse::<LogLevel>().unwrap(), LogLevel::Detailed);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_level_allows() {
        assert!(!LogLevel::Quiet.allows(LogLevel::Basic));
        assert!(!LogLevel::Quiet.allows(LogLevel::Quiet));
        assert!(LogLevel::Basic.allows(LogLevel::Basic));
        assert!(!LogLevel::Basic.allows(LogLevel::Detailed));
        assert!(LogLevel::Detailed.allows(LogLevel::Basic));
        assert!(LogLevel::Detailed.allows(LogLevel::Detailed));
    }

    #[test]
    fn test_level_serde() {
        let json = serde_json::to_string(&LogLevel::Detailed).unwrap();
        assert_eq!(json, "\"detailed\"");
        let level: LogLevel = serde_json::from_str("\"quiet\"").unwrap();
        assert_eq!(level, LogLevel::Quiet);
    }
}
