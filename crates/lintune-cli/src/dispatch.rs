use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use lintune_core::{EngineConfig, StepId};
use lintune_engine::{ReconciliationEngine, UninstallOptions};
use serde_json::Value;
use tracing::{debug, info};

use crate::completion::write_completions_script;
use crate::render::{
    current_output_style, format_backup_lines, format_enrollment_lines, format_plan_lines,
    format_run_summary, format_status_lines, format_teardown_lines, render_status_line,
    run_summary_json, step_record_json, EventRenderer, OutputStyle,
};
use crate::{Cli, Commands};

pub(crate) const DEFAULT_CONFIG_PATH: &str = "/etc/lintune/lintune.toml";

/// Explicit `--config`, else the system file when it exists, else defaults.
/// `--root` always wins over the file's `root`.
pub(crate) fn load_config(
    explicit: Option<&Path>,
    system_default: &Path,
    root: Option<&Path>,
) -> Result<EngineConfig> {
    let source = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None if system_default.exists() => Some(system_default.to_path_buf()),
        None => None,
    };

    let mut config = match source {
        Some(path) => {
            debug!(path = %path.display(), "loading configuration");
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            EngineConfig::from_toml_str(&raw)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(root) = root {
        config.root = root.to_path_buf();
    }
    Ok(config)
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

fn print_json(value: &Value) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to encode JSON output")?;
    println!("{rendered}");
    Ok(())
}

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = cli.command {
        return write_completions_script(shell, &mut io::stdout().lock());
    }

    let config = load_config(
        cli.config.as_deref(),
        &PathBuf::from(DEFAULT_CONFIG_PATH),
        cli.root.as_deref(),
    )?;
    if let Commands::Config = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let style = if cli.json {
        OutputStyle::Plain
    } else {
        current_output_style()
    };
    let engine = ReconciliationEngine::with_system_services(config)?;
    info!(root = %engine.layout().root().display(), "engine ready");

    match cli.command {
        Commands::Status => {
            let status = engine.probe();
            if cli.json {
                print_json(&serde_json::to_value(&status)?)?;
            } else {
                print_lines(&format_status_lines(&status, style));
            }
        }
        Commands::Plan { operator } => {
            let plan = engine.plan(&operator.to_input());
            if cli.json {
                print_json(&serde_json::to_value(&plan)?)?;
            } else {
                print_lines(&format_plan_lines(&plan, style));
            }
        }
        Commands::Run { step, operator } => {
            let input = operator.to_input();
            let mut renderer = EventRenderer::new(style, cli.json);
            match step {
                Some(raw) => {
                    let id = StepId::parse(&raw)?;
                    let record = engine.run_one(id, &input, &mut renderer)?;
                    drop(renderer);
                    if cli.json {
                        print_json(&step_record_json(&record))?;
                    }
                    if let Some(err) = record.outcome.error() {
                        return Err(anyhow!("step '{id}' failed: {err}"));
                    }
                }
                None => {
                    let run = engine.run_all(&input, &mut renderer)?;
                    drop(renderer);
                    if cli.json {
                        print_json(&run_summary_json(&run))?;
                    } else {
                        print_lines(&format_run_summary(&run, style));
                    }
                    if let Some(record) = run.failure() {
                        return Err(anyhow!("provisioning halted at step '{}'", record.id));
                    }
                    if run.cancelled {
                        return Err(anyhow!("provisioning cancelled"));
                    }
                }
            }
        }
        Commands::Rollback => {
            let report = engine.rollback()?;
            if cli.json {
                print_json(&serde_json::to_value(&report)?)?;
            } else {
                print_lines(&format_teardown_lines("rollback", &report, style));
            }
        }
        Commands::Uninstall {
            remove_toolchain,
            revert_login_manager,
        } => {
            let report = engine.full_uninstall(UninstallOptions {
                remove_toolchain,
                revert_login_manager,
            })?;
            if cli.json {
                print_json(&serde_json::to_value(&report)?)?;
            } else {
                print_lines(&format_teardown_lines("uninstall", &report, style));
                if !remove_toolchain {
                    println!(
                        "{}",
                        render_status_line(
                            style,
                            "info",
                            "build toolchain kept; pass --remove-toolchain to remove it",
                        )
                    );
                }
            }
        }
        Commands::Backups => {
            let records = engine.backups()?;
            if cli.json {
                print_json(&serde_json::to_value(&records)?)?;
            } else {
                print_lines(&format_backup_lines(&records, style));
            }
        }
        Commands::Enrollment => {
            let report = engine.enrollment();
            if cli.json {
                print_json(&serde_json::to_value(&report)?)?;
            } else {
                print_lines(&format_enrollment_lines(&report, style));
            }
        }
        Commands::CacheClear => {
            let message = engine.clear_cache()?;
            if cli.json {
                print_json(&serde_json::json!({ "message": message }))?;
            } else {
                println!("{}", render_status_line(style, "ok", &message));
            }
        }
        Commands::Completions { .. } | Commands::Config => {}
    }

    Ok(())
}
