//! Colored table output for queue counts.

use crate::store::{Mode, QueueStats};
use crate::theme::{Semantic, ThemedCell};
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL};

/// Build the per-mode status table.
pub fn status_table(stats: &QueueStats) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Mode", "Pending", "In flight", "Generated", "Errored"]);

    for mode in Mode::ALL {
        let counts = stats.for_mode(mode);
        let number = |n: u64, semantic: Semantic| {
            Cell::new(n)
                .set_alignment(CellAlignment::Right)
                .themed(if n == 0 { Semantic::Muted } else { semantic })
        };
        table.add_row(vec![
            Cell::new(mode.as_str()).themed(Semantic::Key),
            number(counts.pending, Semantic::Pending),
            number(counts.in_flight, Semantic::InFlight),
            number(counts.generated, Semantic::Done),
            number(counts.errored, Semantic::Failed),
        ]);
    }
    table
}
