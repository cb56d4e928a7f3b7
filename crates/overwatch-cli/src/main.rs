//! `overwatch` – command line entry point for the governance layer.
//!
//! ```text
//! overwatch run    [config]          start workers, wait for Ctrl-C, shut down
//! overwatch verify [config]          verify the audit chain
//! overwatch export <file> [config]   export the audit trail and verify the copy
//! ```
//!
//! The config path defaults to `overwatch.toml`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use overwatch_audit::{AuditSigner, AuditTrail, IntegrityReport, verify_export};
use overwatch_runtime::{GovernanceConfig, Supervisor, telemetry};
use tracing::warn;

const DEFAULT_CONFIG: &str = "overwatch.toml";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

enum Command {
    Run(PathBuf),
    Verify(PathBuf),
    Export { file: PathBuf, config: PathBuf },
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let config_at = |i: usize| {
        PathBuf::from(args.get(i).map(String::as_str).unwrap_or(DEFAULT_CONFIG))
    };
    match args.first().map(String::as_str) {
        Some("run") => Ok(Command::Run(config_at(1))),
        Some("verify") => Ok(Command::Verify(config_at(1))),
        Some("export") => match args.get(1) {
            Some(file) => Ok(Command::Export {
                file: PathBuf::from(file),
                config: config_at(2),
            }),
            None => Err("export needs an output file".into()),
        },
        Some(other) => Err(format!("unknown command {other:?}")),
        None => Err("no command given".into()),
    }
}

fn main() -> ExitCode {
    let _guard = telemetry::init_tracing("overwatch");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {e}", "error".red().bold());
            print_usage();
            return ExitCode::from(2);
        }
    };

    let result = match command {
        Command::Run(config) => run(&config),
        Command::Verify(config) => verify(&config),
        Command::Export { file, config } => export(&file, &config),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: {e}", "error".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &Path) -> Result<GovernanceConfig, String> {
    let cfg = GovernanceConfig::load(path).map_err(|e| e.to_string())?;
    println!("  Config loaded from {}", path.display().to_string().bold());
    Ok(cfg)
}

fn open_trail(cfg: &GovernanceConfig) -> Result<AuditTrail, String> {
    let signer = AuditSigner::from_secret(cfg.audit.secret.as_bytes());
    AuditTrail::open(&cfg.audit.path, signer).map_err(|e| e.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// run
// ─────────────────────────────────────────────────────────────────────────────

fn run(config: &Path) -> Result<ExitCode, String> {
    let cfg = load_config(config)?;
    let supervisor = Supervisor::initialize(cfg).map_err(|e| e.to_string())?;

    let stop = Arc::new(tokio::sync::Notify::new());
    let stop_signal = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        stop_signal.notify_one();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; stop the process with SIGKILL");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start runtime: {e}"))?;

    let summary = runtime.block_on(async {
        supervisor.start().map_err(|e| e.to_string())?;
        println!("  {} governance workers running", "✓".green().bold());
        stop.notified().await;
        supervisor
            .shutdown(true, SHUTDOWN_TIMEOUT)
            .await
            .map_err(|e| e.to_string())
    })?;

    if let Some(report) = &summary.graceful {
        println!(
            "  {} {} terminated, {} force-terminated",
            "✓".green().bold(),
            report.terminated.len(),
            report.force_terminated.len()
        );
        if !report.incomplete.is_empty() {
            println!(
                "  {} shutdown incomplete for: {}",
                "✗".red().bold(),
                report.incomplete.join(", ")
            );
            return Ok(ExitCode::FAILURE);
        }
    }
    if !summary.workers_stopped {
        println!("  {} some workers had to be aborted", "!".yellow().bold());
    }
    Ok(ExitCode::SUCCESS)
}

// ─────────────────────────────────────────────────────────────────────────────
// verify / export
// ─────────────────────────────────────────────────────────────────────────────

fn verify(config: &Path) -> Result<ExitCode, String> {
    let cfg = load_config(config)?;
    let trail = open_trail(&cfg)?;
    let report = trail.verify_integrity(..).map_err(|e| e.to_string())?;
    Ok(print_report("audit trail", &report))
}

fn export(file: &Path, config: &Path) -> Result<ExitCode, String> {
    let cfg = load_config(config)?;
    let trail = open_trail(&cfg)?;
    let export = trail.export(file).map_err(|e| e.to_string())?;
    println!(
        "  {} {} entries written to {}",
        "✓".green().bold(),
        export.entries.len(),
        file.display().to_string().bold()
    );
    let report = verify_export(file, trail.signer()).map_err(|e| e.to_string())?;
    Ok(print_report("export", &report))
}

fn print_report(what: &str, report: &IntegrityReport) -> ExitCode {
    let range = match (report.first_sequence, report.last_sequence) {
        (Some(first), Some(last)) => format!("#{first}..#{last}"),
        _ => "empty".to_string(),
    };
    if report.ok {
        println!(
            "  {} {what} intact: {} entries checked ({range})",
            "✓".green().bold(),
            report.checked
        );
        return ExitCode::SUCCESS;
    }
    println!(
        "  {} {what} has {} violation(s) across {} entries ({range})",
        "✗".red().bold(),
        report.violations.len(),
        report.checked
    );
    for v in &report.violations {
        println!(
            "    #{:<8} {:<22} {}",
            v.sequence,
            format!("{:?}", v.kind).yellow(),
            v.detail
        );
    }
    ExitCode::FAILURE
}

fn print_usage() {
    println!();
    println!("  {} {}", "Overwatch".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!();
    println!("  Usage:");
    println!("    overwatch run    [config]");
    println!("    overwatch verify [config]");
    println!("    overwatch export <file> [config]");
    println!();
    println!("  The config path defaults to {}.", DEFAULT_CONFIG.bold());
}
