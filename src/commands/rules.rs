use crate::SyncContext;
use crate::config::rules::{Side, SyncConfiguration, SyncRule};
use crate::output;
use anyhow::Result;
use colored::Colorize;

/// Show the sync rules, creating the file first with `init`
///
/// # Errors
///
/// Returns an error if the rules file cannot be read, parsed or created.
pub fn execute(ctx: &SyncContext, init: bool) -> Result<()> {
    let path = ctx.config.rules_path();
    if !path.exists() && !init {
        output::warning(&format!(
            "No sync rules at {}; run 'devsync rules --init' to create one",
            path.display()
        ));
        return Ok(());
    }

    let existed = path.exists();
    let rules = SyncConfiguration::load(&path)?;
    if !existed {
        output::success(&format!("Created placeholder rules at {}", path.display()));
    }

    output::info(&format!("Rules from {}", path.display()));
    for (index, rule) in rules.rules().iter().enumerate() {
        println!("{}", describe(index + 1, rule));
    }

    if let Err(e) = rules.check_complete() {
        output::warning(&e.to_string());
    }
    if rules.roots(Side::Local).is_empty() {
        output::info("No active rules; edit the file to pair a host root with a device root");
    }
    Ok(())
}

/// One rule as a short block of text
fn describe(number: usize, rule: &SyncRule) -> String {
    let local = rule.root(Side::Local);
    let remote = rule.root(Side::Remote);
    if local.is_empty() && remote.is_empty() {
        return format!("{} {}", format!("#{number}").bold(), "(placeholder)".dimmed());
    }

    let mut text = format!(
        "{} {} <-> {}\n    unique local: {}, new local: {}, new remote: {}, unique remote: {}",
        format!("#{number}").bold(),
        local,
        remote,
        rule.unique_local,
        rule.new_local,
        rule.new_remote,
        rule.unique_remote
    );
    if !rule.excl.is_empty() {
        text.push_str(&format!("\n    excluding: {}", rule.excl.join(", ")));
    }
    text
}
