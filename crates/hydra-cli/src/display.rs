//! Terminal rendering for fork results and progress.

use console::style;

use hydra_db::models::{Fork, ForkStatus, Job, JobProgress};

/// Color a fork status for terminal output.
pub fn styled_status(status: ForkStatus) -> String {
    let text = status.to_string();
    match status {
        ForkStatus::Success => style(text).green().to_string(),
        ForkStatus::Pending | ForkStatus::Running => style(text).cyan().to_string(),
        ForkStatus::BudgetExceeded | ForkStatus::Timeout => style(text).yellow().to_string(),
        ForkStatus::Failed | ForkStatus::Cancelled => style(text).red().to_string(),
    }
}

/// Print the per-fork result table.
pub fn print_fork_table(forks: &[Fork]) {
    println!(
        "{:<6} {:<17} {:>10} {:>10}  {}",
        "FORK", "STATUS", "COST", "DURATION", "ERROR"
    );
    println!("{}", "-".repeat(80));
    for fork in forks {
        let error = fork
            .error
            .as_deref()
            .map(|e| truncate(e, 50))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<17} {:>10} {:>10}  {}",
            fork.fork_num,
            styled_status(fork.status),
            format!("${:.4}", fork.cost_usd),
            format!("{:.1}s", fork.duration_seconds),
            error,
        );
    }
}

/// Print the summary panel for a finished job.
pub fn print_summary(job: &Job, forks: &[Fork]) {
    let successful = forks
        .iter()
        .filter(|f| f.status == ForkStatus::Success)
        .count();
    let failed = forks.len() - successful;
    let total_cost: f64 = forks.iter().map(|f| f.cost_usd).sum();

    println!();
    println!("{}", style("Summary").bold());
    println!("  Total forks: {}", job.num_forks);
    println!("  {} {}", style("Successful:").green(), successful);
    println!("  {} {}", style("Failed:").red(), failed);
    println!("  {} ${:.4}", style("Total cost:").yellow(), total_cost);
    println!(
        "  {} {:.1}s",
        style("Duration:").blue(),
        job.total_duration_seconds.unwrap_or(0.0)
    );
}

/// Print the progress table for `hydra status`.
pub fn print_progress(job: &Job, progress: &JobProgress) {
    println!();
    println!("{} {}", style("Workflow:").bold(), job.id);
    println!("  Status:      {}", job.status);
    println!("  Total forks: {}", progress.total);
    println!("  Completed:   {}", progress.completed);
    println!("  Failed:      {}", progress.failed);
    println!("  In progress: {}", progress.in_progress);
    println!("  Total cost:  ${:.4}", progress.total_cost_usd);
    println!("  Paused:      {}", progress.paused);
    println!("  Cancelled:   {}", progress.cancelled);
}

/// Truncate a string for table display.
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{head}...")
}
