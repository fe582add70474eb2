//! Problem records and their result fields.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Which kind of data a worker generates for a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Ground-truth run: solvability, objective kind, time to first solution.
    Label,
    /// Periodic statistics capture run.
    Features,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Label, Mode::Features];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Label => "label",
            Mode::Features => "features",
        }
    }

    pub(crate) fn claimed_column(&self) -> &'static str {
        match self {
            Mode::Label => "claimed_label",
            Mode::Features => "claimed_features",
        }
    }

    pub(crate) fn generated_column(&self) -> &'static str {
        match self {
            Mode::Label => "generated_label",
            Mode::Features => "generated_features",
        }
    }

    pub(crate) fn token_column(&self) -> &'static str {
        match self {
            Mode::Label => "label_claim_token",
            Mode::Features => "features_claim_token",
        }
    }

    pub(crate) fn claimed_at_column(&self) -> &'static str {
        match self {
            Mode::Label => "label_claimed_at",
            Mode::Features => "features_claimed_at",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "label" => Ok(Mode::Label),
            "features" => Ok(Mode::Features),
            _ => Err(format!(
                "Unknown mode: '{}'. Valid options: label, features",
                s
            )),
        }
    }
}

/// Objective kind inferred from a label run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProblemType {
    Sat,
    Opt,
    #[default]
    Unknown,
}

impl ProblemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemType::Sat => "SAT",
            ProblemType::Opt => "OPT",
            ProblemType::Unknown => "UNKNOWN",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "SAT" => ProblemType::Sat,
            "OPT" => ProblemType::Opt,
            _ => ProblemType::Unknown,
        }
    }
}

impl fmt::Display for ProblemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Solver statistics captured at one save point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Percentage of the time limit this snapshot stands for.
    pub percent: f64,
    /// Metric name to value, as reported by the solver.
    pub features: BTreeMap<String, f64>,
}

/// The exclusive lease a worker holds on a claimed problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimLease {
    pub mode: Mode,
    pub token: String,
}

/// A unit of work: one model, optionally paired with one data file.
#[derive(Debug, Clone, PartialEq)]
pub struct Problem {
    pub id: i64,
    /// Model file, relative to the data directory unless absolute.
    pub model_ref: String,
    /// Instance data file; absent for model-only problems.
    pub instance_ref: Option<String>,
    /// Budget in milliseconds, assigned at dispatch time.
    pub time_limit: Option<u64>,
    pub problem_type: ProblemType,
    /// Solver time in milliseconds of the last solution reported, if any.
    pub time_to_solution: Option<f64>,
    pub solved: bool,
    pub error: bool,
    pub statistics: Vec<StatisticsSnapshot>,
    pub claimed_label: bool,
    pub claimed_features: bool,
    pub generated_label: bool,
    pub generated_features: bool,
    pub updated_at: Option<DateTime<Utc>>,
    /// Set only on records returned by `claim_next`.
    pub lease: Option<ClaimLease>,
}

impl Problem {
    /// Parse a row from the `problems` table.
    pub(crate) fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let statistics_json: String = row.get("statistics")?;
        let statistics = serde_json::from_str(&statistics_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let problem_type: Option<String> = row.get("problem_type")?;
        let time_limit: Option<i64> = row.get("time_limit")?;
        let updated_at: Option<i64> = row.get("updated_at")?;

        Ok(Self {
            id: row.get("id")?,
            model_ref: row.get("model_ref")?,
            instance_ref: row.get("instance_ref")?,
            time_limit: time_limit.map(|t| t as u64),
            problem_type: problem_type
                .as_deref()
                .map(ProblemType::parse)
                .unwrap_or_default(),
            time_to_solution: row.get("time_to_solution")?,
            solved: row.get("solved")?,
            error: row.get("error")?,
            statistics,
            claimed_label: row.get("claimed_label")?,
            claimed_features: row.get("claimed_features")?,
            generated_label: row.get("generated_label")?,
            generated_features: row.get("generated_features")?,
            updated_at: updated_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            lease: None,
        })
    }
}

/// Per-mode queue counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModeStats {
    /// Not yet claimed.
    pub pending: u64,
    /// Claimed but not finished (running, or stale after a crash).
    pub in_flight: u64,
    /// Finished, including errored.
    pub generated: u64,
    /// Finished with `error` set.
    pub errored: u64,
}

/// Snapshot of the whole queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub label: ModeStats,
    pub features: ModeStats,
}

impl QueueStats {
    pub fn for_mode(&self, mode: Mode) -> &ModeStats {
        match mode {
            Mode::Label => &self.label,
            Mode::Features => &self.features,
        }
    }
}
