use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::error::ErrorKind;
use clap::Parser;
use lintune_core::{
    DisplayManagerState, EngineError, EnrollmentReport, ProbeIssue, StepEvent, StepEventKind,
    StepId, StepOutcome, StepRecord, SystemStatus,
};
use lintune_engine::{BackupRecord, InstallationRun, TeardownReport};

use crate::completion::write_completions_script;
use crate::dispatch::load_config;
use crate::render::*;
use crate::{default_log_directive, Cli, CliCompletionShell, Commands};

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_dir() -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "lintune-cli-tests-{}-{}",
        std::process::id(),
        TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("must create test dir");
    path
}

fn clean_status() -> SystemStatus {
    SystemStatus {
        display_manager: DisplayManagerState::Absent,
        dependencies_installed: false,
        daemon_installed: false,
        daemon_version: None,
        services_registered: false,
        name_resolution_configured: false,
        auth_stack_configured: false,
        domain: None,
        local_groups: Vec::new(),
        cron_running: false,
        daemon_running: false,
        daemon_tasks_running: false,
        backups_present: false,
        interrupted_step: None,
        probe_errors: Vec::new(),
    }
}

fn halted_run() -> InstallationRun {
    InstallationRun {
        run_id: Some("run-1-2".to_string()),
        records: vec![
            StepRecord {
                id: StepId::LoginManager,
                outcome: StepOutcome::Skipped,
            },
            StepRecord {
                id: StepId::Dependencies,
                outcome: StepOutcome::Succeeded {
                    warnings: vec!["cache was stale".to_string()],
                },
            },
            StepRecord {
                id: StepId::DaemonBuild,
                outcome: StepOutcome::Failed(EngineError::CommandFailed {
                    context: "cargo build failed".to_string(),
                    detail: "exit status 101".to_string(),
                }),
            },
            StepRecord {
                id: StepId::CacheDirectories,
                outcome: StepOutcome::NotAttempted,
            },
        ],
        last_attempted: Some(StepId::DaemonBuild),
        cancelled: false,
    }
}

#[test]
fn cli_parses_run_with_step_and_operator_flags() {
    let cli = Cli::try_parse_from([
        "lintune",
        "run",
        "--step",
        "domain-config",
        "--domain",
        "contoso.onmicrosoft.com",
        "--elevated-groups",
    ])
    .expect("command must parse");

    match cli.command {
        Commands::Run { step, operator } => {
            assert_eq!(step.as_deref(), Some("domain-config"));
            let input = operator.to_input();
            assert_eq!(input.domain.as_deref(), Some("contoso.onmicrosoft.com"));
            assert_eq!(input.local_groups(), vec!["users", "wheel"]);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_accepts_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from(["lintune", "status", "--root", "/tmp/sim", "--json", "-vv"])
        .expect("command must parse");
    assert!(matches!(cli.command, Commands::Status));
    assert_eq!(cli.root, Some(PathBuf::from("/tmp/sim")));
    assert!(cli.json);
    assert_eq!(cli.verbose, 2);
}

#[test]
fn cli_parses_uninstall_opt_ins() {
    let cli = Cli::try_parse_from(["lintune", "uninstall", "--revert-login-manager"])
        .expect("command must parse");
    match cli.command {
        Commands::Uninstall {
            remove_toolchain,
            revert_login_manager,
        } => {
            assert!(!remove_toolchain);
            assert!(revert_login_manager);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_parses_maintenance_subcommands() {
    let cli = Cli::try_parse_from(["lintune", "cache-clear"]).expect("command must parse");
    assert!(matches!(cli.command, Commands::CacheClear));

    let cli = Cli::try_parse_from(["lintune", "enrollment", "--json"]).expect("command must parse");
    assert!(matches!(cli.command, Commands::Enrollment));
    assert!(cli.json);
}

#[test]
fn enrollment_lines_show_state_and_error() {
    let report = EnrollmentReport::from_journal(
        "Oct 16 09:05:00 host himmelblaud[812]: Failed to enroll in Intune\n",
        true,
    );
    assert_eq!(
        format_enrollment_lines(&report, OutputStyle::Plain),
        vec![
            "enrollment: enrollment failed",
            "compliance: n/a",
            "last activity: Oct 16 09:05:00",
            "Intune enrollment failed",
        ]
    );

    let lines = format_enrollment_lines(
        &EnrollmentReport::unknown("daemon not responding: timeout"),
        OutputStyle::Rich,
    );
    assert!(lines[0].contains("== intune =="));
    assert_eq!(
        lines.last().map(String::as_str),
        Some("[WARN] daemon not responding: timeout")
    );
}

#[test]
fn cli_rejects_unknown_subcommand() {
    let err = Cli::try_parse_from(["lintune", "enroll"]).expect_err("must reject");
    assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
}

#[test]
fn cli_rejects_unknown_completion_shell() {
    let err = Cli::try_parse_from(["lintune", "completions", "tcsh"]).expect_err("must reject");
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
}

#[test]
fn verbosity_maps_to_log_directives() {
    assert_eq!(default_log_directive(0), "warn");
    assert_eq!(default_log_directive(1), "info");
    assert_eq!(default_log_directive(2), "debug");
    assert_eq!(default_log_directive(7), "debug");
}

#[test]
fn resolve_output_style_follows_stdout_tty() {
    assert_eq!(resolve_output_style(true), OutputStyle::Rich);
    assert_eq!(resolve_output_style(false), OutputStyle::Plain);
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "host reconciled"),
        "host reconciled"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "err", "halted"),
        "[ERR] halted"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "warn", "no backup"),
        "[WARN] no backup"
    );
}

#[test]
fn event_lines_prefix_step_token() {
    let failed = StepEvent::new(StepId::DaemonStart, StepEventKind::Failed, "daemon unhealthy");
    assert_eq!(
        format_event_line(OutputStyle::Rich, &failed).as_deref(),
        Some("[ERR] daemon-start: daemon unhealthy")
    );

    let skipped = StepEvent::new(StepId::Scheduler, StepEventKind::Skipped, "already satisfied");
    assert_eq!(
        format_event_line(OutputStyle::Plain, &skipped).as_deref(),
        Some("scheduler: already satisfied")
    );
}

#[test]
fn output_events_are_indented_in_plain_mode_only() {
    let output = StepEvent::new(StepId::DaemonBuild, StepEventKind::Output, "Compiling himmelblau");
    assert_eq!(
        format_event_line(OutputStyle::Plain, &output).as_deref(),
        Some("  Compiling himmelblau")
    );
    assert_eq!(format_event_line(OutputStyle::Rich, &output), None);
}

#[test]
fn plan_lines_mark_config_editing_steps() {
    let lines = format_plan_lines(
        &[StepId::Dependencies, StepId::NameResolution],
        OutputStyle::Plain,
    );
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with(" 1. dependencies"));
    assert!(!lines[0].contains("[modifies system config]"));
    assert!(lines[1].starts_with(" 2. name-resolution"));
    assert!(lines[1].ends_with("[modifies system config]"));
}

#[test]
fn empty_plan_reports_nothing_to_do() {
    assert_eq!(
        format_plan_lines(&[], OutputStyle::Plain),
        vec!["nothing to do; every step is satisfied".to_string()]
    );
}

#[test]
fn status_lines_cover_every_fact_in_plain_mode() {
    let mut status = clean_status();
    status.daemon_installed = true;
    status.daemon_version = Some("himmelblau 0.9.0".to_string());
    status.domain = Some("contoso.onmicrosoft.com".to_string());
    status.local_groups = vec!["users".to_string()];

    let lines = format_status_lines(&status, OutputStyle::Plain);
    assert_eq!(lines[0], "phase: partially-configured");
    assert!(lines.contains(&"login manager: absent".to_string()));
    assert!(lines.contains(&"daemon: installed (himmelblau 0.9.0)".to_string()));
    assert!(lines.contains(&"domain: contoso.onmicrosoft.com (local groups: users)".to_string()));
    assert!(lines.contains(&"auth stack: not configured".to_string()));
    assert!(lines.contains(&"backups: none".to_string()));
}

#[test]
fn status_lines_warn_about_interruption_and_unreadable_paths() {
    let mut status = clean_status();
    status.interrupted_step = Some(StepId::DaemonBuild);
    status.probe_errors.push(ProbeIssue {
        path: PathBuf::from("/etc/himmelblau/himmelblau.conf"),
        message: "Permission denied".to_string(),
    });

    let lines = format_status_lines(&status, OutputStyle::Rich);
    assert!(lines
        .iter()
        .any(|line| line == "[WARN] previous run was interrupted during 'daemon-build'"));
    assert!(lines.iter().any(|line| line
        == "[WARN] could not read /etc/himmelblau/himmelblau.conf: Permission denied"));
}

#[test]
fn run_summary_reports_halt_and_step_warnings() {
    let lines = format_run_summary(&halted_run(), OutputStyle::Plain);
    assert_eq!(lines[0], "1 applied, 1 already satisfied, 1 not attempted");
    assert_eq!(lines[1], "dependencies: cache was stale");
    assert_eq!(
        lines[2],
        "halted at 'daemon-build': cargo build failed: exit status 101"
    );
    assert_eq!(lines.len(), 3);
}

#[test]
fn run_summary_reports_success_and_cancellation() {
    let mut run = InstallationRun::default();
    run.records.push(StepRecord {
        id: StepId::LoginManager,
        outcome: StepOutcome::Skipped,
    });
    let lines = format_run_summary(&run, OutputStyle::Rich);
    assert_eq!(lines.last().map(String::as_str), Some("[OK] host reconciled"));

    run.cancelled = true;
    let lines = format_run_summary(&run, OutputStyle::Rich);
    assert_eq!(
        lines.last().map(String::as_str),
        Some("[WARN] run cancelled between steps")
    );
}

#[test]
fn run_summary_json_carries_outcome_tokens() {
    let value = run_summary_json(&halted_run());
    assert_eq!(value["success"], false);
    assert_eq!(value["last_attempted"], "daemon-build");
    assert_eq!(value["steps"][0]["outcome"], "skipped");
    assert_eq!(value["steps"][1]["warnings"][0], "cache was stale");
    assert_eq!(value["steps"][2]["outcome"], "failed");
    assert_eq!(
        value["steps"][2]["error"],
        "cargo build failed: exit status 101"
    );
    assert_eq!(value["steps"][3]["outcome"], "not_attempted");
}

#[test]
fn single_step_json_matches_run_summary_entries() {
    let run = halted_run();
    let failed = &run.records[2];
    let value = step_record_json(failed);
    assert_eq!(value, run_summary_json(&run)["steps"][2]);
    assert_eq!(value["step"], "daemon-build");
    assert_eq!(value["outcome"], "failed");
    assert_eq!(value["warnings"], serde_json::json!([]));
}

#[test]
fn teardown_lines_list_actions_then_warnings() {
    let report = TeardownReport {
        actions: vec!["stopped himmelblaud.service".to_string()],
        warnings: vec!["no backup for /etc/nsswitch.conf".to_string()],
    };
    assert_eq!(
        format_teardown_lines("rollback", &report, OutputStyle::Plain),
        vec![
            "stopped himmelblaud.service".to_string(),
            "no backup for /etc/nsswitch.conf".to_string(),
        ]
    );
    assert_eq!(
        format_teardown_lines("rollback", &TeardownReport::default(), OutputStyle::Plain),
        vec!["nothing to undo".to_string()]
    );
}

#[test]
fn backup_lines_shorten_digest() {
    let record = BackupRecord {
        original_path: PathBuf::from("/etc/nsswitch.conf"),
        backup_path: PathBuf::from("/etc/nsswitch.conf.backup"),
        created_at_unix_nanos: 1_771_001_234_000_000_000,
        sha256: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".to_string(),
        existed: true,
    };
    let absent = BackupRecord {
        original_path: PathBuf::from("/etc/systemd/system/himmelblaud.service"),
        backup_path: PathBuf::from("/etc/systemd/system/himmelblaud.service.backup"),
        created_at_unix_nanos: 1_771_001_234_000_000_000,
        sha256: String::new(),
        existed: false,
    };
    assert_eq!(
        format_backup_lines(&[record, absent], OutputStyle::Plain),
        vec![
            "/etc/nsswitch.conf -> /etc/nsswitch.conf.backup (sha256 e3b0c44298fc, created 1771001234)"
                .to_string(),
            "/etc/systemd/system/himmelblaud.service (absent before install; removed on restore)"
                .to_string(),
        ]
    );
    assert_eq!(
        format_backup_lines(&[], OutputStyle::Rich),
        vec!["[OK] no backups recorded".to_string()]
    );
}

#[test]
fn load_config_falls_back_to_defaults_and_applies_root() {
    let dir = test_dir();
    let config = load_config(None, &dir.join("missing.toml"), Some(&dir.join("sim")))
        .expect("defaults must load");
    assert_eq!(config.root, dir.join("sim"));
    assert_eq!(config.daemon.unit, "himmelblaud");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn load_config_reads_system_file_when_present() {
    let dir = test_dir();
    let system = dir.join("lintune.toml");
    fs::write(&system, "[daemon]\nhealth_attempts = 3\n").expect("must write config");

    let config = load_config(None, &system, None).expect("config must load");
    assert_eq!(config.daemon.health_attempts, 3);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn load_config_reports_invalid_explicit_file() {
    let dir = test_dir();
    let explicit = dir.join("bad.toml");
    fs::write(&explicit, "[daemon]\nhealth_attempts = 0\n").expect("must write config");

    let err = load_config(Some(&explicit), &dir.join("missing.toml"), None)
        .expect_err("zero attempts must be rejected");
    assert!(format!("{err:#}").contains("health_attempts"));

    let err = load_config(Some(&dir.join("absent.toml")), &dir.join("missing.toml"), None)
        .expect_err("missing explicit file must fail");
    assert!(err.to_string().contains("failed to read config"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn completion_script_names_binary_and_subcommands() {
    let mut output = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut output)
        .expect("completion script must render");
    let script = String::from_utf8(output).expect("script must be utf-8");
    assert!(script.contains("lintune"));
    assert!(script.contains("uninstall"));
    assert!(script.contains("--remove-toolchain"));
}
