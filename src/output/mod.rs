//! Output formatting for queue and problem reports.

pub mod json;
pub mod table;

use crate::store::{Problem, QueueStats};
use crate::theme::Themed;

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Colored table output (default).
    #[default]
    Table,
    /// JSON output.
    Json,
}

/// Print queue counts.
pub fn print_status(stats: &QueueStats, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            println!("{} {}", "Problems:".label(), stats.total.count());
            println!("{}", table::status_table(stats));
        }
        OutputFormat::Json => json::print_json(stats),
    }
}

/// Print one problem record as labelled fields.
pub fn print_problem(problem: &Problem) {
    let yes_no = |b: bool| if b { "yes" } else { "no" };

    println!("{} {}", "Problem".section_header(), problem.id.count());
    println!("{} {}", "Model:".label(), problem.model_ref);
    println!(
        "{} {}",
        "Instance:".label(),
        problem.instance_ref.as_deref().unwrap_or("-")
    );
    if let Some(limit) = problem.time_limit {
        println!("{} {} ms", "Time limit:".label(), limit);
    }
    println!(
        "{} claimed={} generated={}",
        "Label:".label(),
        yes_no(problem.claimed_label),
        yes_no(problem.generated_label)
    );
    println!(
        "{} claimed={} generated={}",
        "Features:".label(),
        yes_no(problem.claimed_features),
        yes_no(problem.generated_features)
    );
    println!("{} {}", "Type:".label(), problem.problem_type);
    println!("{} {}", "Solved:".label(), yes_no(problem.solved));
    if let Some(tts) = problem.time_to_solution {
        println!("{} {:.0} ms", "Time to solution:".label(), tts);
    }
    if problem.error {
        println!("{} {}", "Error:".label(), "yes".error_style());
    }
    println!(
        "{} {}",
        "Snapshots:".label(),
        problem.statistics.len().count()
    );
    if let Some(updated) = problem.updated_at {
        println!(
            "{} {}",
            "Updated:".label(),
            updated.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
}
