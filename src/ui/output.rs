//! Output functions for consistent CLI formatting

use super::context::UiContext;
use console::style;

/// Display a title line
pub fn intro(ctx: &UiContext, title: &str) {
    if ctx.is_styled() {
        println!("{}", style(title).cyan().bold());
    } else {
        println!("{}", title);
    }
    println!();
}

/// Display a success step with detail
pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    if ctx.is_styled() {
        println!("  {} {} ({})", style("✓").green(), message, style(detail).dim());
    } else {
        println!("  [OK] {} ({})", message, detail);
    }
}

/// Display an error step with detail
pub fn step_error_detail(ctx: &UiContext, message: &str, detail: &str) {
    if ctx.is_styled() {
        println!("  {} {}: {}", style("✗").red(), message, style(detail).red());
    } else {
        println!("  [FAIL] {}: {}", message, detail);
    }
}

/// Display a warning step
pub fn step_warn(ctx: &UiContext, message: &str) {
    if ctx.is_styled() {
        println!("  {} {}", style("!").yellow(), message);
    } else {
        println!("  [WARN] {}", message);
    }
}

/// Display a dimmed remark under the previous step
pub fn remark(ctx: &UiContext, message: &str) {
    if ctx.is_styled() {
        println!("      {}", style(message).dim());
    } else {
        println!("      {}", message);
    }
}

/// Print a key-value pair
pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    if ctx.is_styled() {
        println!("  {}: {}", style(key).dim(), value);
    } else {
        println!("  {}: {}", key, value);
    }
}

/// Display the closing line of a successful run
pub fn outro_success(ctx: &UiContext, message: &str) {
    println!();
    if ctx.is_styled() {
        println!("{}", style(message).green().bold());
    } else {
        println!("[OK] {}", message);
    }
}

/// Display the closing line of a failed run
pub fn outro_error(ctx: &UiContext, message: &str) {
    println!();
    if ctx.is_styled() {
        println!("{}", style(message).red().bold());
    } else {
        println!("[ERROR] {}", message);
    }
}
