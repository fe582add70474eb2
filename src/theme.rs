//! Color theming for terminal output.
//!
//! Colors are disabled globally by `--no-color` or `NO_COLOR`; every helper
//! here then returns unstyled text and tables get no cell colors.

use owo_colors::OwoColorize;
use std::sync::atomic::{AtomicBool, Ordering};

static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable all colors globally.
///
/// Affects both owo_colors output and comfy_table cells. Call early in
/// `main`.
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

/// Semantic categories for queue and problem output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semantic {
    /// Mode names and problem ids
    Key,
    /// Work not yet claimed
    Pending,
    /// Claimed and not finished
    InFlight,
    /// Finished successfully
    Done,
    /// Finished with an error
    Failed,
    Muted,
}

/// comfy_table color for a category, `None` when colors are disabled.
pub fn table_color(semantic: Semantic) -> Option<comfy_table::Color> {
    if !colors_enabled() {
        return None;
    }
    Some(match semantic {
        Semantic::Key => comfy_table::Color::Cyan,
        Semantic::Pending => comfy_table::Color::Yellow,
        Semantic::InFlight => comfy_table::Color::Blue,
        Semantic::Done => comfy_table::Color::Green,
        Semantic::Failed => comfy_table::Color::Red,
        Semantic::Muted => comfy_table::Color::DarkGrey,
    })
}

pub trait ThemedCell {
    fn themed(self, semantic: Semantic) -> Self;
}

impl ThemedCell for comfy_table::Cell {
    fn themed(self, semantic: Semantic) -> Self {
        match table_color(semantic) {
            Some(color) => self.fg(color),
            None => self,
        }
    }
}

fn paint<T: std::fmt::Display>(value: &T, style: impl FnOnce(&T) -> String) -> String {
    if colors_enabled() {
        style(value)
    } else {
        value.to_string()
    }
}

/// Semantic styling for plain terminal text.
pub trait Themed: std::fmt::Display + Sized {
    /// Field names (yellow).
    fn label(&self) -> String {
        paint(self, |v| v.yellow().to_string())
    }

    /// Success messages (green + bold).
    fn success(&self) -> String {
        paint(self, |v| v.green().bold().to_string())
    }

    /// Warnings (yellow).
    fn warning(&self) -> String {
        paint(self, |v| v.yellow().to_string())
    }

    /// Errors (red + bold).
    fn error_style(&self) -> String {
        paint(self, |v| v.red().bold().to_string())
    }

    /// Section headers (bold + underline).
    fn section_header(&self) -> String {
        paint(self, |v| v.bold().underline().to_string())
    }

    /// Counts and ids (cyan).
    fn count(&self) -> String {
        paint(self, |v| v.cyan().to_string())
    }

    fn muted(&self) -> String {
        paint(self, |v| v.dimmed().to_string())
    }
}

impl Themed for String {}
impl Themed for &str {}
impl Themed for i64 {}
impl Themed for u64 {}
impl Themed for usize {}
