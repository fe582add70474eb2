//! JSON output.

use crate::store::Problem;
use serde::Serialize;
use serde_json::{Value, json};

/// Print any serializable report as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) {
    let json = serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string());
    println!("{}", json);
}

/// JSON view of a problem record, including its snapshots.
pub fn problem_json(problem: &Problem) -> Value {
    json!({
        "id": problem.id,
        "model": problem.model_ref,
        "instance": problem.instance_ref,
        "time_limit": problem.time_limit,
        "problem_type": problem.problem_type,
        "time_to_solution": problem.time_to_solution,
        "solved": problem.solved,
        "error": problem.error,
        "claimed_label": problem.claimed_label,
        "claimed_features": problem.claimed_features,
        "generated_label": problem.generated_label,
        "generated_features": problem.generated_features,
        "updated_at": problem.updated_at.map(|t| t.to_rfc3339()),
        "statistics": problem.statistics,
    })
}
