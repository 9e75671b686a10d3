use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use lintune_core::{
    EnrollmentReport, EnrollmentState, StepEvent, StepEventKind, StepId, StepOutcome, StepRecord,
    SystemStatus,
};
use lintune_engine::{step, BackupRecord, InstallationRun, ProgressSink, TeardownReport};
use tracing::warn;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(std::io::stdout().is_terminal())
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        "step" => "[>>]",
        "skip" => "[--]",
        _ => "[..]",
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn value_style(set: bool) -> Style {
    let color = if set {
        AnsiColor::BrightGreen
    } else {
        AnsiColor::BrightYellow
    };
    Style::new().fg_color(Some(color.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(colorize(section_style(), &format!("== {title} =="))),
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

/// Terminal line for an event, or `None` for streamed output that the
/// spinner absorbs in rich mode.
pub(crate) fn format_event_line(style: OutputStyle, event: &StepEvent) -> Option<String> {
    let message = format!("{}: {}", event.step, event.message);
    let status = match event.kind {
        StepEventKind::Started => "step",
        StepEventKind::Output => {
            return match style {
                OutputStyle::Plain => Some(format!("  {}", event.message)),
                OutputStyle::Rich => None,
            };
        }
        StepEventKind::Warning => "warn",
        StepEventKind::Skipped | StepEventKind::NotAttempted => "skip",
        StepEventKind::Succeeded => "ok",
        StepEventKind::Failed => "err",
    };
    Some(render_status_line(style, status, &message))
}

/// Progress sink used by `run`: JSON lines, plain lines, or a spinner per
/// step in an interactive terminal.
pub(crate) struct EventRenderer {
    style: OutputStyle,
    json: bool,
    spinner: Option<ProgressBar>,
    started_at: Option<Instant>,
}

impl EventRenderer {
    pub(crate) fn new(style: OutputStyle, json: bool) -> Self {
        Self {
            style,
            json,
            spinner: None,
            started_at: None,
        }
    }

    fn start_spinner(&mut self, event: &StepEvent) {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan.bold} {prefix:<18} {msg}") {
            spinner.set_style(style.tick_chars("|/-\\ "));
        }
        spinner.set_prefix(event.step.to_string());
        spinner.set_message(event.message.clone());
        spinner.enable_steady_tick(Duration::from_millis(80));
        self.spinner = Some(spinner);
    }

    fn print(&self, line: String) {
        match &self.spinner {
            Some(spinner) => spinner.println(line),
            None => println!("{line}"),
        }
    }

    fn finish(&mut self, event: &StepEvent) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
        let Some(mut line) = format_event_line(self.style, event) else {
            return;
        };
        if event.kind == StepEventKind::Succeeded {
            if let Some(started_at) = self.started_at.take() {
                line.push_str(&format!(" ({})", format_elapsed(started_at.elapsed())));
            }
        }
        println!("{line}");
    }
}

impl ProgressSink for EventRenderer {
    fn event(&mut self, event: &StepEvent) {
        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(error = %err, "failed to encode progress event"),
            }
            return;
        }

        match event.kind {
            StepEventKind::Started => {
                self.started_at = Some(Instant::now());
                if self.style == OutputStyle::Rich {
                    self.start_spinner(event);
                } else if let Some(line) = format_event_line(self.style, event) {
                    println!("{line}");
                }
            }
            StepEventKind::Output => match (&self.spinner, format_event_line(self.style, event)) {
                (Some(spinner), _) => spinner.set_message(event.message.clone()),
                (None, Some(line)) => println!("{line}"),
                (None, None) => {}
            },
            StepEventKind::Warning => {
                if let Some(line) = format_event_line(self.style, event) {
                    self.print(line);
                }
            }
            StepEventKind::Skipped
            | StepEventKind::Succeeded
            | StepEventKind::Failed
            | StepEventKind::NotAttempted => self.finish(event),
        }
    }
}

impl Drop for EventRenderer {
    fn drop(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

fn yes_no(style: OutputStyle, set: bool, yes: &str, no: &str) -> String {
    let text = if set { yes } else { no };
    match style {
        OutputStyle::Plain => text.to_string(),
        OutputStyle::Rich => colorize(value_style(set), text),
    }
}

pub(crate) fn format_status_lines(status: &SystemStatus, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(header) = render_section_header(style, "host status") {
        lines.push(header);
    }
    lines.push(format!("phase: {}", status.phase().as_str()));
    lines.push(format!("login manager: {}", status.display_manager));
    lines.push(format!(
        "dependencies: {}",
        yes_no(style, status.dependencies_installed, "installed", "missing")
    ));
    let daemon = yes_no(style, status.daemon_installed, "installed", "not installed");
    match status.daemon_version.as_deref() {
        Some(version) => lines.push(format!("daemon: {daemon} ({version})")),
        None => lines.push(format!("daemon: {daemon}")),
    }
    lines.push(format!(
        "services: {}",
        yes_no(style, status.services_registered, "registered", "not registered")
    ));
    lines.push(format!(
        "name resolution: {}",
        yes_no(style, status.name_resolution_configured, "configured", "not configured")
    ));
    lines.push(format!(
        "auth stack: {}",
        yes_no(style, status.auth_stack_configured, "configured", "not configured")
    ));
    match status.domain.as_deref() {
        Some(domain) if status.local_groups.is_empty() => lines.push(format!("domain: {domain}")),
        Some(domain) => lines.push(format!(
            "domain: {domain} (local groups: {})",
            status.local_groups.join(", ")
        )),
        None => lines.push(format!("domain: {}", yes_no(style, false, "set", "not set"))),
    }
    lines.push(format!(
        "scheduler: {}",
        yes_no(style, status.cron_running, "running", "stopped")
    ));
    lines.push(format!(
        "daemon service: {}",
        yes_no(style, status.daemon_running, "running", "stopped")
    ));
    lines.push(format!(
        "daemon tasks: {}",
        yes_no(style, status.daemon_tasks_running, "running", "stopped")
    ));
    lines.push(format!(
        "backups: {}",
        if status.backups_present { "present" } else { "none" }
    ));

    if let Some(step) = status.interrupted_step {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("previous run was interrupted during '{step}'"),
        ));
    }
    for issue in &status.probe_errors {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("could not read {}: {}", issue.path.display(), issue.message),
        ));
    }
    lines
}

pub(crate) fn format_enrollment_lines(
    report: &EnrollmentReport,
    style: OutputStyle,
) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(header) = render_section_header(style, "intune") {
        lines.push(header);
    }
    let state = report.state.to_string();
    lines.push(format!(
        "enrollment: {}",
        yes_no(style, report.is_enrolled(), &state, &state)
    ));
    lines.push(format!("compliance: {}", report.compliance));
    if let Some(activity) = report.last_activity.as_deref() {
        lines.push(format!("last activity: {activity}"));
    }
    if let Some(error) = report.error.as_deref() {
        let status = match report.state {
            EnrollmentState::Unknown => "warn",
            _ => "err",
        };
        lines.push(render_status_line(style, status, error));
    }
    lines
}

pub(crate) fn format_plan_lines(plan: &[StepId], style: OutputStyle) -> Vec<String> {
    if plan.is_empty() {
        return vec![render_status_line(
            style,
            "ok",
            "nothing to do; every step is satisfied",
        )];
    }
    let mut lines = Vec::new();
    if let Some(header) = render_section_header(style, "plan") {
        lines.push(header);
    }
    for (index, id) in plan.iter().enumerate() {
        let planned = step(*id);
        let marker = if planned.destructive {
            " [modifies system config]"
        } else {
            ""
        };
        lines.push(format!(
            "{:>2}. {:<18} {}{marker}",
            index + 1,
            id,
            planned.description
        ));
    }
    lines
}

pub(crate) fn format_run_summary(run: &InstallationRun, style: OutputStyle) -> Vec<String> {
    let mut succeeded = 0;
    let mut skipped = 0;
    let mut not_attempted = 0;
    let mut warnings = Vec::new();
    for record in &run.records {
        match &record.outcome {
            StepOutcome::Succeeded { warnings: step_warnings } => {
                succeeded += 1;
                warnings.extend(
                    step_warnings
                        .iter()
                        .map(|warning| format!("{}: {warning}", record.id)),
                );
            }
            StepOutcome::Skipped => skipped += 1,
            StepOutcome::NotAttempted => not_attempted += 1,
            StepOutcome::Failed(_) => {}
        }
    }

    let mut lines = Vec::new();
    if let Some(header) = render_section_header(style, "summary") {
        lines.push(header);
    }
    lines.push(format!(
        "{succeeded} applied, {skipped} already satisfied, {not_attempted} not attempted"
    ));
    for warning in warnings {
        lines.push(render_status_line(style, "warn", &warning));
    }
    if run.cancelled {
        lines.push(render_status_line(style, "warn", "run cancelled between steps"));
    }
    match run.failure() {
        Some(record) => {
            let detail = record
                .outcome
                .error()
                .map(ToString::to_string)
                .unwrap_or_default();
            lines.push(render_status_line(
                style,
                "err",
                &format!("halted at '{}': {detail}", record.id),
            ));
        }
        None if !run.cancelled => {
            lines.push(render_status_line(style, "ok", "host reconciled"));
        }
        None => {}
    }
    lines
}

pub(crate) fn step_record_json(record: &StepRecord) -> serde_json::Value {
    serde_json::json!({
        "step": record.id,
        "outcome": record.outcome.kind(),
        "error": record.outcome.error().map(ToString::to_string),
        "warnings": match &record.outcome {
            StepOutcome::Succeeded { warnings } => warnings.clone(),
            _ => Vec::new(),
        },
    })
}

pub(crate) fn run_summary_json(run: &InstallationRun) -> serde_json::Value {
    let steps = run.records.iter().map(step_record_json).collect::<Vec<_>>();
    serde_json::json!({
        "run_id": run.run_id,
        "success": run.is_success(),
        "cancelled": run.cancelled,
        "last_attempted": run.last_attempted,
        "steps": steps,
    })
}

pub(crate) fn format_teardown_lines(
    title: &str,
    report: &TeardownReport,
    style: OutputStyle,
) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(header) = render_section_header(style, title) {
        lines.push(header);
    }
    if report.actions.is_empty() && report.warnings.is_empty() {
        lines.push(render_status_line(style, "ok", "nothing to undo"));
    }
    for action in &report.actions {
        lines.push(render_status_line(style, "ok", action));
    }
    for warning in &report.warnings {
        lines.push(render_status_line(style, "warn", warning));
    }
    lines
}

pub(crate) fn format_backup_lines(records: &[BackupRecord], style: OutputStyle) -> Vec<String> {
    if records.is_empty() {
        return vec![render_status_line(style, "ok", "no backups recorded")];
    }
    records
        .iter()
        .map(|record| {
            if !record.existed {
                return format!(
                    "{} (absent before install; removed on restore)",
                    record.original_path.display()
                );
            }
            let short_digest = record.sha256.get(..12).unwrap_or(&record.sha256);
            format!(
                "{} -> {} (sha256 {short_digest}, created {})",
                record.original_path.display(),
                record.backup_path.display(),
                record.created_at_unix_nanos / 1_000_000_000
            )
        })
        .collect()
}
