//! Console output helpers shared across commands: colored status lines
//! and `comfy-table` table construction.

use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Table};

/// Create a table with the standard UTF8 preset used across commands.
#[must_use]
pub fn create_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table
}

/// Print an error message to stderr.
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "ERROR:".bright_red().bold(), msg);
}

/// Print a warning message to stderr.
pub fn print_warning(msg: &str) {
    eprintln!("{} {}", "WARNING:".bright_yellow().bold(), msg);
}

/// Print a success message to stdout.
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".bright_green().bold(), msg);
}

/// Print an informational message to stdout.
pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".bright_blue().bold(), msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_table_is_empty_by_default() {
        let table = create_table();
        assert_eq!(table.row_count(), 0);
    }
}
