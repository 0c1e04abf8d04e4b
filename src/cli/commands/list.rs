//! List command - show known targets

use crate::config::Config;
use console::style;

/// Execute the list command
pub fn execute(config: &Config) {
    println!(
        "{:<12} {:<20} {:<10}",
        style("TARGET").bold(),
        style("BASE IMAGE").bold(),
        style("VERSION").bold()
    );
    println!("{}", "-".repeat(42));

    for target in &config.targets {
        println!(
            "{:<12} {:<20} {:<10}",
            target.name, target.base_image, target.version_label
        );
    }

    println!();
    println!("{} target(s); build them all with: kfx-dist all", config.targets.len());
}
