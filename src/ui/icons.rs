//! Shared UI icons.
//!
//! Each icon has a plain-text fallback for terminals without emoji support.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");

// Step indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static ROLLBACK: Emoji<'_, '_> = Emoji("↩️  ", "[UNDO]");
pub static HINT: Emoji<'_, '_> = Emoji("💡 ", "hint:");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
pub static REPORT: Emoji<'_, '_> = Emoji("📄 ", "");
