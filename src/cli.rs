//! installscope: capture what an installer changes and generate deployment scripts
//!
//! Usage:
//!   installscope capture --output pre.json         Snapshot the current system state
//!   installscope diff --pre a.json --post b.json -p App
//!                                                  Diff two snapshots into a change set
//!   installscope generate --change-set App-changes.json
//!                                                  Render detection/uninstall scripts
//!   installscope detect --change-set App-changes.json
//!                                                  Evaluate detection here (exit 0/1)
//!   installscope run -p App --installer setup.msi  Capture, install, capture, diff, generate
//!   installscope config init|show                  Manage the pipeline configuration

use clap::{Parser, Subcommand};
use colored::*;
use std::fs;
use std::path::{Path, PathBuf};

use installscope::services::change_record::{ChangeSet, ChangeSetBuilder};
use installscope::services::collector::{query_service_states, SnapshotCollector};
use installscope::services::config::PipelineConfig;
use installscope::services::detection::DetectionScriptGenerator;
use installscope::services::differ::SnapshotDiffer;
use installscope::services::logs::{LogLevel, PipelineLog};
use installscope::services::orchestrator::{
    change_set_file_name, generate_scripts, GeneratedScripts, InstallerCommand, Orchestrator,
    ProcessRunner, ScriptSelection, LOG_FILE,
};
use installscope::services::paths::get_config_path;
use installscope::services::registry::system_registry;
use installscope::services::retry::ThreadSleeper;
use installscope::services::snapshot::SystemSnapshot;
use installscope::services::validation::validate_project_name;

// ─── CLI Definition ───────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "installscope",
    about = "installscope - installation change capture",
    version,
    long_about = "Capture what a Windows installer changes (files, registry, services, programs)\nand generate detection and uninstall scripts from the evidence."
)]
struct Cli {
    /// Pipeline config file (default: <local data dir>/installscope/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a snapshot of the current system state
    Capture {
        /// Where to write the snapshot JSON
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Diff two snapshots and write the change set plus scripts
    Diff {
        /// Snapshot taken before the install
        #[arg(long)]
        pre: PathBuf,
        /// Snapshot taken after the install
        #[arg(long)]
        post: PathBuf,
        /// Project name used for artifact file names
        #[arg(short, long)]
        project: String,
        /// Output directory (default: from config)
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Diff the snapshots as captured: no registry re-capture or re-read
        #[arg(long)]
        offline: bool,
    },

    /// Generate scripts from a saved change set (both unless one is chosen)
    Generate {
        #[arg(long)]
        change_set: PathBuf,
        /// Generate the detection script
        #[arg(long)]
        detection: bool,
        /// Generate the uninstall script
        #[arg(long)]
        uninstall: bool,
        /// Output directory (default: next to the change set)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Evaluate detection for a change set on this machine (exit 0 = met, 1 = not met)
    Detect {
        #[arg(long)]
        change_set: PathBuf,
    },

    /// Capture, run the installer, capture again, diff and generate
    Run {
        #[arg(short, long)]
        project: String,
        /// Installer executable or .msi package
        #[arg(long)]
        installer: PathBuf,
        /// Output directory (default: from config)
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Extra installer arguments, after `--`
        #[arg(last = true)]
        installer_args: Vec<String>,
    },

    /// Manage the pipeline configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

// ─── Helpers ──────────────────────────────────────────────────────

fn print_header() {
    println!();
    println!("  {} {}", "●".bright_green(), "installscope".bold().white());
    println!("  {}", "Installation change capture".dimmed());
    println!();
}

fn print_log_summary(log: &PipelineLog) {
    let warnings = log.count(LogLevel::Warning);
    let errors = log.count(LogLevel::Error);
    if warnings == 0 && errors == 0 {
        return;
    }
    println!(
        "  {} {} warnings, {} errors",
        "!".yellow(),
        warnings.to_string().yellow(),
        errors.to_string().red()
    );
}

fn print_scripts(scripts: &GeneratedScripts) {
    match &scripts.detection {
        Some(path) => println!("  {} Detection  {}", "✓".green(), path.display()),
        None => println!("  {} Detection  {}", "✗".red(), "not generated".dimmed()),
    }
    match &scripts.uninstall {
        Some(path) => println!("  {} Uninstall  {}", "✓".green(), path.display()),
        None => println!("  {} Uninstall  {}", "✗".red(), "not generated".dimmed()),
    }
}

fn print_change_set(change_set: &ChangeSet) {
    println!("  {}", "CHANGES".dimmed().bold());
    println!("  {}", "─".repeat(40).dimmed());
    let rows = [
        ("New files", change_set.new_files.len()),
        ("Modified files", change_set.modified_files.len()),
        ("Registry keys", change_set.new_registry_keys.len()),
        ("Services", change_set.new_services.len()),
        ("Programs", change_set.new_programs.len()),
    ];
    for (label, count) in rows {
        let count_str = if count > 0 { count.to_string().cyan() } else { count.to_string().dimmed() };
        println!("  {:<16} {}", label, count_str);
    }
    println!("  {}", "─".repeat(40).dimmed());
}

fn ensure_dir(dir: &Path) -> Result<(), String> {
    fs::create_dir_all(dir).map_err(|e| format!("Failed to create {}: {}", dir.display(), e))
}

// ─── Command Handlers ─────────────────────────────────────────────

fn cmd_capture(config: &PipelineConfig, output: &Path) -> Result<i32, String> {
    let registry = system_registry();
    let mut log = PipelineLog::new();
    let states = query_service_states().unwrap_or_else(|e| {
        log.warn("collector", format!("Service states unavailable: {}", e));
        Default::default()
    });

    let snapshot = SnapshotCollector::new(registry.as_ref())
        .with_service_states(states)
        .capture(&config.capture_options(), &mut log)?;
    snapshot.save(output)?;

    println!(
        "  {} Captured {} files, {} registry keys, {} services, {} programs",
        "✓".green(),
        snapshot.files.len(),
        snapshot.registry_entries.len(),
        snapshot.services.len(),
        snapshot.programs.len()
    );
    println!("  {} {}", "→".dimmed(), output.display());
    print_log_summary(&log);
    Ok(0)
}

fn cmd_diff(
    config: &PipelineConfig,
    pre: &Path,
    post: &Path,
    project: &str,
    output_dir: Option<PathBuf>,
    offline: bool,
) -> Result<i32, String> {
    validate_project_name(project).map_err(|e| e.to_string())?;
    let pre = SystemSnapshot::load(pre)?;
    let post = SystemSnapshot::load(post)?;

    let output_dir = output_dir.unwrap_or_else(|| config.output_dir());
    ensure_dir(&output_dir)?;

    let registry = system_registry();
    let options = config.capture_options();
    let collector = SnapshotCollector::new(registry.as_ref());
    let differ = if offline {
        SnapshotDiffer::offline(&ThreadSleeper)
    } else {
        SnapshotDiffer::new(registry.as_ref(), config.retry_policy(), &ThreadSleeper)
    };

    let mut log = PipelineLog::new();
    let mut recapture_log = PipelineLog::new();
    let outcome = differ.diff(
        &pre,
        &post,
        || collector.capture_registry(&options.registry_roots, options.depth, &mut recapture_log),
        &mut log,
    );
    log.append(recapture_log);

    let change_set = ChangeSetBuilder::new(project).build(outcome.changes, chrono::Local::now(), &mut log);
    let change_set_path = output_dir.join(change_set_file_name(project));
    change_set.save(&change_set_path)?;

    let scripts = generate_scripts(
        &change_set,
        &output_dir,
        &config.program_files_roots(),
        ScriptSelection::both(),
        &mut log,
    )?;
    log.write_to(&output_dir.join(LOG_FILE))?;

    print_header();
    print_change_set(&change_set);
    println!("  {} Change set {}", "✓".green(), change_set_path.display());
    print_scripts(&scripts);
    print_log_summary(&log);
    println!();
    Ok(0)
}

fn cmd_generate(
    config: &PipelineConfig,
    change_set_path: &Path,
    detection: bool,
    uninstall: bool,
    output_dir: Option<PathBuf>,
) -> Result<i32, String> {
    let change_set = ChangeSet::load(change_set_path)?;
    let selection = if detection || uninstall {
        ScriptSelection { detection, uninstall }
    } else {
        ScriptSelection::both()
    };

    let output_dir = output_dir
        .or_else(|| change_set_path.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    ensure_dir(&output_dir)?;

    let mut log = PipelineLog::new();
    let scripts = generate_scripts(
        &change_set,
        &output_dir,
        &config.program_files_roots(),
        selection,
        &mut log,
    )?;

    print_scripts(&scripts);
    for event in log.events().iter().filter(|e| e.level == LogLevel::Error) {
        println!("  {} {}", "✗".red(), event.message);
    }

    let failed = (selection.detection && scripts.detection.is_none())
        || (selection.uninstall && scripts.uninstall.is_none());
    Ok(if failed { 1 } else { 0 })
}

fn cmd_detect(change_set_path: &Path) -> Result<i32, String> {
    let change_set = ChangeSet::load(change_set_path)?;
    let registry = system_registry();
    let result = DetectionScriptGenerator::evaluate(&change_set, registry.as_ref()).map_err(|e| e.to_string())?;

    let version = result.installed_version.as_deref().unwrap_or("unknown");
    if !result.found {
        println!("  {} {} not detected", "✗".red(), change_set.project_name());
    } else if result.requirement_met {
        println!("  {} {} detected (version {})", "✓".green(), change_set.project_name(), version.cyan());
    } else {
        println!(
            "  {} {} {} is older than required",
            "✗".red(),
            change_set.project_name(),
            version.yellow()
        );
    }
    if let Some(path) = &result.matched_path {
        println!("  {} {}", "→".dimmed(), path.dimmed());
    }
    Ok(result.exit_code())
}

fn cmd_run(
    config: &PipelineConfig,
    project: &str,
    installer: PathBuf,
    installer_args: Vec<String>,
    output_dir: Option<PathBuf>,
) -> Result<i32, String> {
    let mut config = config.clone();
    if let Some(dir) = output_dir {
        config.output_dir = Some(dir.to_string_lossy().to_string());
    }

    print_header();
    println!("  {} Capturing, installing and diffing '{}'", "→".dimmed(), project.white().bold());
    println!();

    let registry = system_registry();
    let orchestrator = Orchestrator::new(&config, registry.as_ref(), &ThreadSleeper, &ProcessRunner);
    let mut log = PipelineLog::new();
    let report = orchestrator.run(project, &InstallerCommand::new(installer, installer_args), &mut log)?;

    print_change_set(&report.change_set);
    println!("  {} Installer exit code {}", "→".dimmed(), report.installer_exit_code);
    if report.registry_retries > 0 {
        println!("  {} Registry re-captured {} times", "→".dimmed(), report.registry_retries);
    }
    println!("  {} Change set {}", "✓".green(), report.change_set_path.display());
    print_scripts(&report.scripts);
    println!("  {} Log {}", "→".dimmed(), report.log_path.display());
    print_log_summary(&log);
    println!();
    Ok(0)
}

fn cmd_config(config_path: Option<&Path>, action: ConfigAction) -> Result<i32, String> {
    let path = config_path.map(Path::to_path_buf).unwrap_or_else(get_config_path);
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                println!("  {} {} already exists (use --force)", "!".yellow(), path.display());
                return Ok(1);
            }
            PipelineConfig::default().save(&path)?;
            println!("  {} Wrote {}", "✓".green(), path.display());
        }
        ConfigAction::Show => {
            let config = PipelineConfig::load(Some(&path))?;
            let json = serde_json::to_string_pretty(&config)
                .map_err(|e| format!("Failed to serialize config: {}", e))?;
            println!("{}", json);
        }
    }
    Ok(0)
}

// ─── Main ─────────────────────────────────────────────────────────

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Config { action } => cmd_config(config_path, action),
        command => PipelineConfig::load(config_path).and_then(|config| match command {
            Commands::Capture { output } => cmd_capture(&config, &output),
            Commands::Diff { pre, post, project, output_dir, offline } => {
                cmd_diff(&config, &pre, &post, &project, output_dir, offline)
            }
            Commands::Generate { change_set, detection, uninstall, output_dir } => {
                cmd_generate(&config, &change_set, detection, uninstall, output_dir)
            }
            Commands::Detect { change_set } => cmd_detect(&change_set),
            Commands::Run { project, installer, output_dir, installer_args } => {
                cmd_run(&config, &project, installer, installer_args, output_dir)
            }
            Commands::Config { .. } => Ok(0),
        }),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("  {} {}", "✗".red(), e);
            std::process::exit(1);
        }
    }
}
