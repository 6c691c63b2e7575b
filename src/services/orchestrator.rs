use chrono::Local;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::change_record::{ChangeSet, ChangeSetBuilder};
use super::collector::{query_service_states, SnapshotCollector};
use super::config::PipelineConfig;
use super::detection::DetectionScriptGenerator;
use super::differ::SnapshotDiffer;
use super::hidden_command;
use super::logs::PipelineLog;
use super::registry::RegistrySource;
use super::retry::Sleeper;
use super::snapshot::SystemSnapshot;
use super::uninstall::UninstallScriptGenerator;
use super::validation::validate_project_name;

const COMPONENT: &str = "orchestrator";

pub const LOG_FILE: &str = "installscope.log";

pub fn change_set_file_name(project_name: &str) -> String {
    format!("{}-changes.json", project_name)
}

pub fn detection_script_file_name(project_name: &str) -> String {
    format!("Detect-{}.ps1", project_name)
}

pub fn uninstall_script_file_name(project_name: &str) -> String {
    format!("Uninstall-{}.ps1", project_name)
}

/// The installer to run between the two captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerCommand {
    pub path: PathBuf,
    pub arguments: Vec<String>,
}

impl InstallerCommand {
    pub fn new(path: impl Into<PathBuf>, arguments: Vec<String>) -> Self {
        InstallerCommand {
            path: path.into(),
            arguments,
        }
    }

    /// Program and arguments. `.msi` packages go through `msiexec /i ... /quiet /norestart`.
    pub fn command_line(&self) -> (String, Vec<String>) {
        let is_msi = self
            .path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("msi"))
            .unwrap_or(false);

        if is_msi {
            let mut args = vec![
                "/i".to_string(),
                self.path.to_string_lossy().to_string(),
                "/quiet".to_string(),
                "/norestart".to_string(),
            ];
            args.extend(self.arguments.iter().cloned());
            ("msiexec".to_string(), args)
        } else {
            (self.path.to_string_lossy().to_string(), self.arguments.clone())
        }
    }
}

/// Runs an installer and reports its exit code.
pub trait InstallerRunner {
    fn run(&self, installer: &InstallerCommand, log: &mut PipelineLog) -> Result<i32, String>;
}

/// Launches the installer as a hidden child process and waits for it.
pub struct ProcessRunner;

impl InstallerRunner for ProcessRunner {
    fn run(&self, installer: &InstallerCommand, log: &mut PipelineLog) -> Result<i32, String> {
        let (program, args) = installer.command_line();
        log.info(COMPONENT, format!("Running installer: {} {}", program, args.join(" ")));

        let status = hidden_command(&program)
            .args(&args)
            .status()
            .map_err(|e| format!("Failed to start installer {}: {}", program, e))?;

        status
            .code()
            .ok_or_else(|| "Installer was terminated without an exit code".to_string())
    }
}

/// Which scripts to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptSelection {
    pub detection: bool,
    pub uninstall: bool,
}

impl ScriptSelection {
    pub fn both() -> Self {
        ScriptSelection {
            detection: true,
            uninstall: true,
        }
    }
}

/// Paths of the scripts that were written. `None` when a generator failed
/// or was not selected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedScripts {
    pub detection: Option<PathBuf>,
    pub uninstall: Option<PathBuf>,
}

/// PowerShell 5.1 reads BOM-less files in the ANSI code page.
fn write_script(path: &Path, content: &str) -> Result<(), String> {
    fs::write(path, format!("\u{FEFF}{}", content))
        .map_err(|e| format!("Failed to write script {}: {}", path.display(), e))
}

/// Run the selected generators on a change set and write their scripts to
/// `output_dir`. A generator that fails is logged and skipped; only write
/// errors are returned.
pub fn generate_scripts(
    change_set: &ChangeSet,
    output_dir: &Path,
    program_files_roots: &[String],
    selection: ScriptSelection,
    log: &mut PipelineLog,
) -> Result<GeneratedScripts, String> {
    let project = change_set.project_name();
    let mut scripts = GeneratedScripts::default();

    if selection.detection {
        match DetectionScriptGenerator::generate(change_set) {
            Ok(script) => {
                let path = output_dir.join(detection_script_file_name(project));
                write_script(&path, &script)?;
                log.info("detection", format!("Wrote {}", path.display()));
                scripts.detection = Some(path);
            }
            Err(e) => log.error("detection", e.to_string()),
        }
    }

    if selection.uninstall {
        let generator = UninstallScriptGenerator::new(program_files_roots.to_vec());
        match generator.generate(change_set) {
            Ok(script) => {
                let path = output_dir.join(uninstall_script_file_name(project));
                write_script(&path, &script)?;
                log.info("uninstall", format!("Wrote {}", path.display()));
                scripts.uninstall = Some(path);
            }
            Err(e) => log.error("uninstall", e.to_string()),
        }
    }

    Ok(scripts)
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub change_set: ChangeSet,
    pub change_set_path: PathBuf,
    pub scripts: GeneratedScripts,
    pub log_path: PathBuf,
    pub installer_exit_code: i32,
    pub registry_retries: u32,
}

type ServiceStateQuery = fn() -> Result<HashMap<String, String>, String>;

/// Sequences one capture-install-capture-diff-generate run.
pub struct Orchestrator<'a> {
    config: &'a PipelineConfig,
    registry: &'a dyn RegistrySource,
    sleeper: &'a dyn Sleeper,
    runner: &'a dyn InstallerRunner,
    service_states: ServiceStateQuery,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        registry: &'a dyn RegistrySource,
        sleeper: &'a dyn Sleeper,
        runner: &'a dyn InstallerRunner,
    ) -> Self {
        Orchestrator {
            config,
            registry,
            sleeper,
            runner,
            service_states: query_service_states,
        }
    }

    pub fn with_service_state_query(mut self, query: ServiceStateQuery) -> Self {
        self.service_states = query;
        self
    }

    /// Full run. The log trail is written to `installscope.log` in the
    /// output directory whether or not the run succeeds.
    pub fn run(
        &self,
        project_name: &str,
        installer: &InstallerCommand,
        log: &mut PipelineLog,
    ) -> Result<RunReport, String> {
        validate_project_name(project_name).map_err(|e| e.to_string())?;

        let output_dir = self.config.output_dir();
        fs::create_dir_all(&output_dir)
            .map_err(|e| format!("Failed to create output dir {}: {}", output_dir.display(), e))?;

        let log_path = output_dir.join(LOG_FILE);
        let result = self.run_steps(project_name, installer, &output_dir, &log_path, log);
        if let Err(e) = &result {
            log.error(COMPONENT, format!("Run failed: {}", e));
        }
        if let Err(e) = log.write_to(&log_path) {
            log::warn!("{}", e);
        }
        result
    }

    fn run_steps(
        &self,
        project_name: &str,
        installer: &InstallerCommand,
        output_dir: &Path,
        log_path: &Path,
        log: &mut PipelineLog,
    ) -> Result<RunReport, String> {
        let options = self.config.capture_options();

        log.info(
            COMPONENT,
            format!("Waiting {}s for the system to settle", self.config.stabilization_delay_secs),
        );
        self.sleeper.sleep(self.config.stabilization_delay());
        let pre = self.capture(log)?;

        let installer_exit_code = self.runner.run(installer, log)?;
        match installer_exit_code {
            0 => log.info(COMPONENT, "Installer finished"),
            3010 => log.info(COMPONENT, "Installer finished, reboot required"),
            code => log.warn(
                COMPONENT,
                format!("Installer exited with code {}; capturing changes anyway", code),
            ),
        }

        log.info(
            COMPONENT,
            format!("Waiting {}s for the installation to finish", self.config.finalization_delay_secs),
        );
        self.sleeper.sleep(self.config.finalization_delay());
        let post = self.capture(log)?;

        let collector = SnapshotCollector::new(self.registry);
        let differ = SnapshotDiffer::new(self.registry, self.config.retry_policy(), self.sleeper);
        let mut recapture_log = PipelineLog::new();
        let outcome = differ.diff(
            &pre,
            &post,
            || collector.capture_registry(&options.registry_roots, options.depth, &mut recapture_log),
            log,
        );
        log.append(recapture_log);

        if outcome.changes.is_empty() {
            log.warn(COMPONENT, "No changes detected");
        }

        let change_set = ChangeSetBuilder::new(project_name).build(outcome.changes, Local::now(), log);
        let change_set_path = output_dir.join(change_set_file_name(project_name));
        change_set.save(&change_set_path)?;
        log.info(COMPONENT, format!("Wrote {}", change_set_path.display()));

        let scripts = generate_scripts(
            &change_set,
            output_dir,
            &self.config.program_files_roots(),
            ScriptSelection::both(),
            log,
        )?;

        Ok(RunReport {
            change_set,
            change_set_path,
            scripts,
            log_path: log_path.to_path_buf(),
            installer_exit_code,
            registry_retries: outcome.registry_retries,
        })
    }

    fn capture(&self, log: &mut PipelineLog) -> Result<SystemSnapshot, String> {
        let states = (self.service_states)().unwrap_or_else(|e| {
            log.warn(COMPONENT, format!("Service states unavailable: {}", e));
            HashMap::new()
        });
        SnapshotCollector::new(self.registry)
            .with_service_states(states)
            .capture(&self.config.capture_options(), log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::registry::{KeyData, MemoryRegistry};
    use crate::services::retry::tests::RecordingSleeper;
    use crate::services::snapshot::RegistryValue;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::tempdir;

    const CODE: &str = "{AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE}";
    const UNINSTALL: &str = r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall";

    /// Registry the fake installer can write to while the orchestrator reads it.
    #[derive(Default)]
    struct SharedRegistry(RefCell<MemoryRegistry>);

    impl RegistrySource for SharedRegistry {
        fn read_key(&self, path: &str) -> Result<Option<KeyData>, String> {
            self.0.borrow().read_key(path)
        }
    }

    /// Installs "Contoso App": one MSI uninstall entry and one directory.
    struct FakeInstaller<'a> {
        registry: &'a SharedRegistry,
        install_dir: PathBuf,
        exit_code: i32,
        write_uninstall_key: bool,
    }

    impl InstallerRunner for FakeInstaller<'_> {
        fn run(&self, _installer: &InstallerCommand, _log: &mut PipelineLog) -> Result<i32, String> {
            fs::create_dir_all(self.install_dir.join("bin")).map_err(|e| e.to_string())?;
            if self.write_uninstall_key {
                let values: BTreeMap<String, RegistryValue> = [
                    ("DisplayName", "Contoso App"),
                    ("DisplayVersion", "3.2.0"),
                    ("UninstallString", "MsiExec.exe /X{AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE}"),
                ]
                .iter()
                .map(|(k, v)| (k.to_string(), RegistryValue::from(*v)))
                .collect();
                self.registry
                    .0
                    .borrow_mut()
                    .set_key(&format!(r"{}\{}", UNINSTALL, CODE), values);
            }
            Ok(self.exit_code)
        }
    }

    fn no_services() -> Result<HashMap<String, String>, String> {
        Ok(HashMap::new())
    }

    fn config(root: &Path) -> PipelineConfig {
        let program_files = root.join("Program Files");
        PipelineConfig {
            scan_paths: vec![program_files.to_string_lossy().to_string()],
            registry_roots: vec![UNINSTALL.to_string()],
            depth: 2,
            program_files_roots: vec![program_files.to_string_lossy().to_string()],
            stabilization_delay_secs: 5,
            finalization_delay_secs: 7,
            retry_delay_secs: 1,
            retry_attempts: 3,
            output_dir: Some(root.join("out").to_string_lossy().to_string()),
        }
    }

    #[test]
    fn test_contoso_end_to_end() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        fs::create_dir_all(dir.path().join("Program Files")).unwrap();

        let registry = SharedRegistry::default();
        let installer = FakeInstaller {
            registry: &registry,
            install_dir: dir.path().join("Program Files").join("Contoso"),
            exit_code: 0,
            write_uninstall_key: true,
        };
        let sleeper = RecordingSleeper::default();
        let orchestrator =
            Orchestrator::new(&config, &registry, &sleeper, &installer).with_service_state_query(no_services);

        let mut log = PipelineLog::new();
        let report = orchestrator
            .run("Contoso", &InstallerCommand::new("setup.msi", Vec::new()), &mut log)
            .unwrap();

        assert_eq!(
            *sleeper.calls.borrow(),
            vec![Duration::from_secs(5), Duration::from_secs(7)]
        );
        assert_eq!(report.registry_retries, 0);
        assert_eq!(report.change_set.new_registry_keys.len(), 1);
        assert_eq!(report.change_set.new_files.len(), 2);

        let saved = ChangeSet::load(&report.change_set_path).unwrap();
        assert_eq!(saved, report.change_set);

        let detection = fs::read_to_string(report.scripts.detection.unwrap()).unwrap();
        assert!(detection.contains(&format!("$ProductCodes = @('{}')", CODE)));
        assert!(detection.contains("$RequiredVersion = '3.2.0'"));

        let uninstall = fs::read_to_string(report.scripts.uninstall.unwrap()).unwrap();
        assert_eq!(uninstall.matches("Kind = '").count(), 1);
        assert!(uninstall.contains(&format!("ProductCode = '{}'", CODE)));
        assert!(uninstall.contains("Contoso'"));
        assert!(!uninstall.contains(r"Contoso\bin"));

        let result = DetectionScriptGenerator::evaluate(&saved, &registry).unwrap();
        assert_eq!(result.installed_version.as_deref(), Some("3.2.0"));
        assert_eq!(result.exit_code(), 0);

        let trail = fs::read_to_string(report.log_path).unwrap();
        assert!(trail.contains("[orchestrator] Installer finished"));
    }

    #[test]
    fn test_generator_failure_is_not_fatal() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        fs::create_dir_all(dir.path().join("Program Files")).unwrap();

        let registry = SharedRegistry::default();
        let installer = FakeInstaller {
            registry: &registry,
            install_dir: dir.path().join("Program Files").join("Portable"),
            exit_code: 1603,
            write_uninstall_key: false,
        };
        let sleeper = RecordingSleeper::default();
        let orchestrator =
            Orchestrator::new(&config, &registry, &sleeper, &installer).with_service_state_query(no_services);

        let mut log = PipelineLog::new();
        let report = orchestrator
            .run("Portable", &InstallerCommand::new("portable.exe", Vec::new()), &mut log)
            .unwrap();

        assert_eq!(report.installer_exit_code, 1603);
        assert!(report.change_set_path.exists());
        assert_eq!(report.scripts, GeneratedScripts::default());
        assert!(log.contains("detection", "No application found"));
        assert!(log.contains("uninstall", "No application found"));
        // registry stayed empty: one sleep before each capture plus two retries
        assert_eq!(sleeper.calls.borrow().len(), 4);
        assert_eq!(report.registry_retries, 2);
    }

    #[test]
    fn test_invalid_project_name_is_rejected() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let registry = SharedRegistry::default();
        let installer = FakeInstaller {
            registry: &registry,
            install_dir: dir.path().join("x"),
            exit_code: 0,
            write_uninstall_key: false,
        };
        let sleeper = RecordingSleeper::default();
        let orchestrator =
            Orchestrator::new(&config, &registry, &sleeper, &installer).with_service_state_query(no_services);

        let mut log = PipelineLog::new();
        let err = orchestrator
            .run("../evil", &InstallerCommand::new("setup.exe", Vec::new()), &mut log)
            .unwrap_err();
        assert!(err.contains("Invalid project name"));
        assert!(sleeper.calls.borrow().is_empty());
    }

    #[test]
    fn test_generate_scripts_selection() {
        let dir = tempdir().unwrap();
        let mut values = BTreeMap::new();
        values.insert("DisplayName".to_string(), RegistryValue::from("Contoso App"));
        let change_set = ChangeSet {
            new_registry_keys: vec![crate::services::snapshot::RegistryEntry::new(
                &format!(r"{}\Contoso", UNINSTALL),
                values,
                0,
            )],
            ..ChangeSetBuilder::new("Contoso").build(Default::default(), Local::now(), &mut PipelineLog::new())
        };

        let mut log = PipelineLog::new();
        let scripts = generate_scripts(
            &change_set,
            dir.path(),
            &[],
            ScriptSelection {
                detection: false,
                uninstall: true,
            },
            &mut log,
        )
        .unwrap();

        assert!(scripts.detection.is_none());
        let path = scripts.uninstall.unwrap();
        assert_eq!(path.file_name().unwrap(), "Uninstall-Contoso.ps1");
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..3], &[0xEF, 0xBB, 0xBF]);
    }

    #[test]
    fn test_msi_installer_command_line() {
        let (program, args) = InstallerCommand::new("Setup.MSI", vec!["ALLUSERS=1".to_string()]).command_line();
        assert_eq!(program, "msiexec");
        assert_eq!(args, vec!["/i", "Setup.MSI", "/quiet", "/norestart", "ALLUSERS=1"]);

        let (program, args) = InstallerCommand::new("setup.exe", vec!["/S".to_string()]).command_line();
        assert_eq!(program, "setup.exe");
        assert_eq!(args, vec!["/S"]);
    }
}
