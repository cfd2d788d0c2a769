//! Terminal front end: progress bars and operator prompts.

use std::time::Duration;

use dialoguer::{Select, theme::ColorfulTheme};
use hauler_ops::{Decision, DecisionRequest, OperationStarted, ScriptProgress};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Format size in human-readable form.
pub fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Operation bar on top of a summary bar.
pub struct ProgressView {
    multi: MultiProgress,
    operation: ProgressBar,
    summary: ProgressBar,
}

impl ProgressView {
    pub fn new(total: u64, hidden: bool) -> Self {
        let multi = MultiProgress::new();
        if hidden {
            multi.set_draw_target(ProgressDrawTarget::hidden());
        }

        let operation = multi.add(ProgressBar::new(0));
        operation.set_style(
            ProgressStyle::default_bar()
                .template("{msg:40!} [{bar:30.cyan/blue}] {percent:>3}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        let summary = multi.add(ProgressBar::new(total));
        summary.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.green}] {percent:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        summary.enable_steady_tick(Duration::from_millis(200));

        Self {
            multi,
            operation,
            summary,
        }
    }

    pub fn operation_started(&self, started: &OperationStarted) {
        let path = if started.target.as_os_str().is_empty() {
            &started.source
        } else {
            &started.target
        };
        self.operation
            .set_message(format!("{} {}", started.verb, path.display()));
        self.operation.set_position(0);
    }

    pub fn update(&self, progress: &ScriptProgress) {
        self.operation.set_length(progress.operation_size.max(1));
        self.operation
            .set_position(progress.operation_done.min(progress.operation_size));
        self.summary.set_length(progress.summary_total.max(1));
        self.summary
            .set_position(progress.summary_done.min(progress.summary_total));
        if progress.transfer_speed > 0 {
            self.summary
                .set_message(format!("{}/s", format_size(progress.transfer_speed)));
        }
    }

    /// Ask the operator with the bars hidden.
    pub fn ask(&self, request: &DecisionRequest) -> Decision {
        tokio::task::block_in_place(|| self.multi.suspend(|| prompt(request)))
    }

    pub fn finish(&self) {
        self.operation.finish_and_clear();
        self.summary.finish_and_clear();
    }
}

fn label(decision: Decision) -> &'static str {
    match decision {
        Decision::Retry => "Retry",
        Decision::Yes => "Yes",
        Decision::YesAll => "Yes to all",
        Decision::Skip => "Skip",
        Decision::SkipAll => "Skip all",
        Decision::Ignore => "Ignore",
        Decision::IgnoreAll => "Ignore all",
        Decision::Cancel => "Cancel",
    }
}

/// Show `request` and read the answer; a broken terminal cancels.
fn prompt(request: &DecisionRequest) -> Decision {
    let mut text = format!("{}: {}", request.category, request.message);
    if let Some(path) = request.path() {
        text.push_str(&format!("\n  {}", path.display()));
    }
    let labels: Vec<&str> = request.allowed.iter().map(|d| label(*d)).collect();

    match Select::with_theme(&ColorfulTheme::default())
        .with_prompt(text)
        .items(&labels)
        .default(0)
        .interact()
    {
        Ok(index) => request.allowed.get(index).copied().unwrap_or(Decision::Cancel),
        Err(_) => Decision::Cancel,
    }
}

/// Answer without asking: overwrite, skip what fails, ignore what is
/// optional.
pub fn auto_answer(request: &DecisionRequest) -> Decision {
    [
        Decision::YesAll,
        Decision::SkipAll,
        Decision::IgnoreAll,
        Decision::Ignore,
    ]
    .into_iter()
    .find(|d| request.allowed.contains(d))
    .unwrap_or(Decision::Cancel)
}
