//! CLI command implementations
//!
//! Commands are organized by domain:
//! - `core` - Core commands (init, config, categories, categorize) and shared utilities
//! - `rules` - Atomic rule commands (list, add, update, delete, enable, disable, test)
//! - `composites` - Composite rule commands
//! - `merchants` - Canonical merchant commands (list, resolve, aliases, merge, normalize)
//! - `feedback` - Feedback commands (record, summary, list)

pub mod composites;
pub mod core;
pub mod feedback;
pub mod merchants;
pub mod rules;

// Re-export command functions for main.rs
pub use composites::*;
pub use core::*;
pub use feedback::*;
pub use merchants::*;
pub use rules::*;

/// Truncate a string to a maximum length, adding "..." if truncated
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
