use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::collector::CaptureOptions;
use super::paths::{expand_env, get_config_path, get_default_output_dir};
use super::registry::{APP_PATHS_ROOTS, UNINSTALL_ROOTS};
use super::retry::RetryPolicy;
use super::uninstall::DEFAULT_PROGRAM_FILES_ROOTS;

/// Pipeline settings. Every field has a default, so a partial file is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directories listed by the collector. `%VAR%` references are expanded.
    pub scan_paths: Vec<String>,
    pub registry_roots: Vec<String>,
    /// Levels below each scan path and registry root.
    pub depth: usize,
    /// Roots whose new subdirectories the uninstall script removes.
    pub program_files_roots: Vec<String>,
    pub stabilization_delay_secs: u64,
    pub finalization_delay_secs: u64,
    pub retry_delay_secs: u64,
    pub retry_attempts: u32,
    pub output_dir: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut registry_roots = vec![r"HKLM\SOFTWARE".to_string(), r"HKCU\SOFTWARE".to_string()];
        registry_roots.extend(UNINSTALL_ROOTS.iter().map(|r| r.to_string()));
        registry_roots.extend(APP_PATHS_ROOTS.iter().map(|r| r.to_string()));

        PipelineConfig {
            scan_paths: vec![
                r"C:\Program Files".to_string(),
                r"C:\Program Files (x86)".to_string(),
                r"C:\ProgramData".to_string(),
                "%APPDATA%".to_string(),
                "%LOCALAPPDATA%".to_string(),
            ],
            registry_roots,
            depth: 2,
            program_files_roots: DEFAULT_PROGRAM_FILES_ROOTS.iter().map(|r| r.to_string()).collect(),
            stabilization_delay_secs: 10,
            finalization_delay_secs: 30,
            retry_delay_secs: 10,
            retry_attempts: 3,
            output_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Load from `path`, or from the default location. A missing file yields
    /// the defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(get_config_path);
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
        let config: PipelineConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config dir: {}", e))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(path, content).map_err(|e| format!("Failed to write config {}: {}", path.display(), e))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.depth == 0 {
            return Err("depth must be at least 1".to_string());
        }
        if self.retry_attempts == 0 {
            return Err("retry_attempts must be at least 1".to_string());
        }
        if self.scan_paths.is_empty() && self.registry_roots.is_empty() {
            return Err("Nothing to capture: scan_paths and registry_roots are both empty".to_string());
        }
        Ok(())
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            paths: self.scan_paths.iter().map(|p| PathBuf::from(expand_env(p))).collect(),
            registry_roots: self.registry_roots.clone(),
            depth: self.depth,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            delay: Duration::from_secs(self.retry_delay_secs),
        }
    }

    pub fn stabilization_delay(&self) -> Duration {
        Duration::from_secs(self.stabilization_delay_secs)
    }

    pub fn finalization_delay(&self) -> Duration {
        Duration::from_secs(self.finalization_delay_secs)
    }

    pub fn program_files_roots(&self) -> Vec<String> {
        self.program_files_roots.iter().map(|r| expand_env(r)).collect()
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .as_deref()
            .map(|dir| PathBuf::from(expand_env(dir)))
            .unwrap_or_else(get_default_output_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert!(config
            .registry_roots
            .iter()
            .any(|r| r.ends_with(r"CurrentVersion\Uninstall")));
        assert!(config
            .registry_roots
            .iter()
            .any(|r| r.ends_with(r"CurrentVersion\App Paths")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig::load(Some(&dir.path().join("config.json"))).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"depth": 4, "retry_delay_secs": 1}"#).unwrap();

        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.depth, 4);
        assert_eq!(config.retry_policy().delay, Duration::from_secs(1));
        assert_eq!(config.retry_attempts, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"retry_attempts": 0}"#).unwrap();
        assert!(PipelineConfig::load(Some(&path)).unwrap_err().contains("retry_attempts"));

        fs::write(&path, "{ not json").unwrap();
        assert!(PipelineConfig::load(Some(&path)).unwrap_err().contains("Failed to parse config"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = PipelineConfig {
            output_dir: Some(dir.path().to_string_lossy().to_string()),
            ..Default::default()
        };

        config.save(&path).unwrap();
        let loaded = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.output_dir(), dir.path());
    }

    #[test]
    fn test_capture_options_expand_env() {
        std::env::set_var("INSTALLSCOPE_TEST_SCAN", "scan-root");
        let config = PipelineConfig {
            scan_paths: vec!["%INSTALLSCOPE_TEST_SCAN%".to_string()],
            depth: 3,
            ..Default::default()
        };
        let options = config.capture_options();
        assert_eq!(options.paths, vec![PathBuf::from("scan-root")]);
        assert_eq!(options.depth, 3);
    }
}
