use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use bastion_core::FileDrift;
use bastion_installer::{ErrorClass, RollbackOutcome};
use indicatif::{HumanCount, ProgressBar, ProgressStyle};

use crate::apply::FailureSummary;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum UiMode {
    Plain,
    Interactive,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
    mode: UiMode,
}

pub(crate) struct TerminalProgress {
    style: OutputStyle,
    label: String,
    total: u64,
    current: u64,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

pub(crate) fn current_output_style() -> OutputStyle {
    output_style_for(
        std::io::stdout().is_terminal(),
        std::env::var_os("NO_COLOR").is_some(),
    )
}

fn output_style_for(is_terminal: bool, no_color: bool) -> OutputStyle {
    if is_terminal && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self {
            style,
            mode: ui_mode_from_style(style),
        }
    }

    pub(crate) fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        match self.style {
            OutputStyle::Plain => println!("{message}"),
            OutputStyle::Rich => println!(
                "{} {message}",
                colorize(status_style(status), status_badge(status))
            ),
        }
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.mode, title) {
            println!();
            let rendered = match self.style {
                OutputStyle::Plain => line,
                OutputStyle::Rich => colorize(section_style(), &line),
            };
            println!("{rendered}");
        }
    }

    pub(crate) fn start_progress(self, label: &str, total: u64) -> TerminalProgress {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new(total.max(1));
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan.bold} {msg:<8} [{bar:20.cyan/blue}] {pos:>3}/{len:3} {elapsed_precise}",
            ) {
                progress_bar.set_style(style.tick_chars(".oO@* ").progress_chars("=>-"));
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        TerminalProgress {
            style: self.style,
            label: label.to_string(),
            total,
            current: 0,
            progress_bar,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn eprint_lines(self, lines: &[String]) {
        for line in lines {
            eprintln!("{line}");
        }
    }
}

impl TerminalProgress {
    pub(crate) fn set(&mut self, current: u64, total: u64) {
        self.total = total;
        self.current = current.min(self.total);

        let Some(progress_bar) = &self.progress_bar else {
            return;
        };

        let safe_total = self.total.max(1);
        progress_bar.set_length(safe_total);
        progress_bar.set_position(self.current.min(safe_total));
    }

    pub(crate) fn finish_success(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };

        progress_bar.finish_and_clear();
        if let Some(line) = render_progress_line(
            self.style,
            &self.label,
            self.current,
            self.total,
            Some(self.started_at.elapsed()),
        ) {
            println!("{line}");
        }
    }

    pub(crate) fn finish_abandon(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.abandon();
        }
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

fn status_style(status: &str) -> Style {
    let color = match status {
        "ok" => AnsiColor::BrightGreen,
        "warn" => AnsiColor::BrightYellow,
        "err" => AnsiColor::BrightRed,
        _ => AnsiColor::BrightBlue,
    };
    Style::new().fg_color(Some(color.into())).effects(Effects::BOLD)
}

/// Status line without color codes; Plain output drops the badge entirely.
pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn class_status(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::Critical => "err",
        ErrorClass::Recoverable | ErrorClass::Warning => "warn",
    }
}

pub(crate) fn format_failure_lines(style: OutputStyle, failure: &FailureSummary) -> Vec<String> {
    let code = failure.code;
    let mut lines = vec![
        render_status_line(
            style,
            class_status(failure.class),
            &format!(
                "{} ({}, {})",
                code.title(),
                code.as_str(),
                failure.class.as_str()
            ),
        ),
        format!("  {}", code.description()),
        format!("  cause: {}", failure.message),
        "  recovery:".to_string(),
    ];
    lines.extend(
        code.recovery_steps()
            .iter()
            .enumerate()
            .map(|(index, step)| format!("    {}. {step}", index + 1)),
    );
    lines
}

pub(crate) fn format_rollback_lines(style: OutputStyle, rollback: &RollbackOutcome) -> Vec<String> {
    if rollback.success {
        return vec![render_status_line(
            style,
            "ok",
            "rollback restored every backed-up path",
        )];
    }

    let mut lines = vec![render_status_line(
        style,
        "err",
        &format!(
            "rollback incomplete: {} path(s) need manual recovery",
            rollback.failed_paths.len()
        ),
    )];
    lines.extend(
        rollback
            .failed_paths
            .iter()
            .map(|path| format!("  - {}", path.display())),
    );
    lines.push(format!(
        "  backup directory: {}",
        rollback.backup_dir.display()
    ));
    lines
}

pub(crate) fn format_drift_lines(style: OutputStyle, drift: &[FileDrift]) -> Vec<String> {
    drift
        .iter()
        .map(|entry| match entry {
            FileDrift::Missing { path } => {
                render_status_line(style, "err", &format!("missing: {path}"))
            }
            FileDrift::Modified {
                path,
                expected,
                actual,
            } => render_status_line(
                style,
                "err",
                &format!("modified: {path} (expected {expected}, found {actual})"),
            ),
        })
        .collect()
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn progress_bar_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightBlue.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn ui_mode_from_style(style: OutputStyle) -> UiMode {
    match style {
        OutputStyle::Plain => UiMode::Plain,
        OutputStyle::Rich => UiMode::Interactive,
    }
}

fn render_section_header(mode: UiMode, title: &str) -> Option<String> {
    match mode {
        UiMode::Plain => None,
        UiMode::Interactive => Some(format!("== {title} ==")),
    }
}

fn render_progress_line(
    style: OutputStyle,
    label: &str,
    current: u64,
    total: u64,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    let width = 18_usize;
    let safe_total = total.max(1);
    let bounded_current = current.min(safe_total);
    let filled = ((bounded_current as usize) * width) / (safe_total as usize);
    let bar = format!(
        "{}{}",
        "=".repeat(filled),
        "-".repeat(width.saturating_sub(filled))
    );
    let percent = (bounded_current * 100) / safe_total;
    let counts = format!("{}/{}", HumanCount(current), HumanCount(total));
    let suffix = elapsed
        .map(|value| format!(" complete in {}", format_elapsed(value)))
        .unwrap_or_default();

    Some(format!(
        "{} [{}] {:>3}% {}{}",
        colorize(progress_label_style(), label),
        colorize(progress_bar_style(), &bar),
        percent,
        counts,
        suffix
    ))
}
