//! Decoding of the solver's newline-delimited JSON event stream.
//!
//! Each line the solver writes to stdout is one JSON object whose `type`
//! field names the event. Types we don't act on decode to
//! [`SolverEvent::Unrecognized`]; lines that are not valid events at all
//! decode to [`SolverEvent::Malformed`] so the stream can carry on.

use crate::error::HarvestError;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Terminal statuses that settle a run on their own.
const CONCLUSIVE_STATUSES: &[&str] = &["OPTIMAL_SOLUTION", "ALL_SOLUTIONS", "UNSATISFIABLE"];

/// Longest slice of an offending line kept in a decode error.
const MAX_QUOTED_LINE: usize = 120;

/// One event from the solver's stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SolverEvent {
    /// A (possibly intermediate) solution.
    Solution {
        #[serde(default)]
        output: Value,
        /// Milliseconds since the solver started.
        #[serde(default)]
        time: Option<f64>,
    },

    /// Final search status.
    Status {
        status: String,
        #[serde(default)]
        time: Option<f64>,
    },

    /// Solver statistics at some point during search.
    Statistics { statistics: Map<String, Value> },

    Comment { comment: String },

    Error {
        #[serde(default)]
        what: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },

    Warning {
        #[serde(default)]
        message: Option<String>,
    },

    /// A line that is not a valid event.
    #[serde(skip)]
    Malformed { reason: String },

    /// Any event type we have no use for.
    #[serde(other)]
    Unrecognized,
}

impl SolverEvent {
    /// Decode one line of solver output.
    ///
    /// Returns `None` for blank lines.
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        Some(serde_json::from_str(line).unwrap_or_else(|e| {
            let quoted: String = line.chars().take(MAX_QUOTED_LINE).collect();
            Self::Malformed {
                reason: format!("{} in line: {}", e, quoted),
            }
        }))
    }

    /// The decode failure behind a malformed line, as an error.
    pub fn decode_error(&self) -> Option<HarvestError> {
        match self {
            Self::Malformed { reason } => Some(HarvestError::Decode(reason.clone())),
            _ => None,
        }
    }

    /// Whether a status event settles the run without a time-limit hit.
    pub fn is_conclusive_status(&self) -> bool {
        matches!(self, Self::Status { status, .. } if CONCLUSIVE_STATUSES.contains(&status.as_str()))
    }

    /// Whether this event says the search proved optimality.
    pub fn is_optimal(&self) -> bool {
        matches!(self, Self::Status { status, .. } if status == "OPTIMAL_SOLUTION")
    }

    /// Whether this is a solution to an optimisation problem.
    ///
    /// The solver adds an `_objective` entry to the solution output (either
    /// directly or under its `json` section) only when there is an objective.
    pub fn has_objective(&self) -> bool {
        let Self::Solution { output, .. } = self else {
            return false;
        };
        output.get("_objective").is_some()
            || output
                .get("json")
                .and_then(|json| json.get("_objective"))
                .is_some()
    }

    /// Whether this is the comment the solver prints when it stops at the time limit.
    pub fn is_time_limit_marker(&self) -> bool {
        matches!(self, Self::Comment { comment } if comment.to_lowercase().contains("time limit exceeded"))
    }

    /// Human-readable message for an error event.
    pub fn error_message(&self) -> Option<String> {
        let Self::Error { what, message } = self else {
            return None;
        };
        Some(match (what, message) {
            (Some(what), Some(message)) => format!("{}: {}", what, message),
            (None, Some(message)) => message.clone(),
            (Some(what), None) => what.clone(),
            (None, None) => "unspecified solver error".to_string(),
        })
    }

    /// Search time in milliseconds reported by a statistics event.
    ///
    /// `time_key` names a statistic measured in seconds.
    pub fn search_time_ms(&self, time_key: &str) -> Option<f64> {
        let Self::Statistics { statistics } = self else {
            return None;
        };
        statistics
            .get(time_key)
            .and_then(Value::as_f64)
            .map(|seconds| seconds * 1000.0)
    }

    /// Numeric entries of a statistics event.
    ///
    /// Booleans count as 0/1; strings and nested values are dropped.
    pub fn numeric_statistics(&self) -> Option<BTreeMap<String, f64>> {
        let Self::Statistics { statistics } = self else {
            return None;
        };
        Some(
            statistics
                .iter()
                .filter_map(|(name, value)| {
                    let number = match value {
                        Value::Number(n) => n.as_f64(),
                        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                        _ => None,
                    }?;
                    Some((name.clone(), number))
                })
                .collect(),
        )
    }
}
