use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

#[cfg(target_os = "windows")]
use super::hidden_command;
use super::logs::PipelineLog;
use super::registry::{
    is_recordable_value, join_key, normalize_key_path, RegistrySource, SERVICES_ROOT, UNINSTALL_ROOTS,
};
use super::snapshot::{
    identity_key, text_value, FileInfo, ProgramInfo, RegistryEntry, RegistryValue, ServiceInfo,
    SystemSnapshot,
};

const COMPONENT: &str = "collector";

/// SERVICE_WIN32_OWN_PROCESS | SERVICE_WIN32_SHARE_PROCESS
const WIN32_SERVICE_TYPES: u64 = 0x10 | 0x20;

/// What to scan. Built from `PipelineConfig`.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub paths: Vec<PathBuf>,
    pub registry_roots: Vec<String>,
    pub depth: usize,
}

/// Per-source bookkeeping. Missing sources count as neither.
#[derive(Debug, Default)]
struct SourceTally {
    ok: usize,
    failed: usize,
}

/// Reads filesystem, registry, service and program state. Never mutates anything.
pub struct SnapshotCollector<'a> {
    registry: &'a dyn RegistrySource,
    service_states: HashMap<String, String>,
}

impl<'a> SnapshotCollector<'a> {
    pub fn new(registry: &'a dyn RegistrySource) -> Self {
        SnapshotCollector {
            registry,
            service_states: HashMap::new(),
        }
    }

    /// Service name -> status, as reported by the service control manager.
    pub fn with_service_states(mut self, states: HashMap<String, String>) -> Self {
        self.service_states = states
            .into_iter()
            .map(|(name, status)| (identity_key(&name), status))
            .collect();
        self
    }

    pub fn capture(
        &self,
        options: &CaptureOptions,
        log: &mut PipelineLog,
    ) -> Result<SystemSnapshot, String> {
        let mut tally = SourceTally::default();

        let files = self.capture_files(&options.paths, options.depth, &mut tally, log);
        let registry_entries =
            self.collect_registry(&options.registry_roots, options.depth, &mut tally, log);
        let services = self.list_services(&mut tally, log);
        let programs = self.list_programs(&mut tally, log);

        if tally.ok == 0 && tally.failed > 0 {
            log.error(COMPONENT, "Every snapshot source failed");
            return Err(format!(
                "Failed to capture snapshot: all {} readable sources failed",
                tally.failed
            ));
        }

        log.info(
            COMPONENT,
            format!(
                "Captured {} files, {} registry keys, {} services, {} programs",
                files.len(),
                registry_entries.len(),
                services.len(),
                programs.len()
            ),
        );

        Ok(SystemSnapshot {
            captured_at: Some(Utc::now()),
            files,
            registry_entries,
            services,
            programs,
        })
    }

    /// Registry part only; the differ uses this to re-capture after a delay.
    pub fn capture_registry(
        &self,
        roots: &[String],
        depth: usize,
        log: &mut PipelineLog,
    ) -> Result<Vec<RegistryEntry>, String> {
        let mut tally = SourceTally::default();
        let entries = self.collect_registry(roots, depth, &mut tally, log);
        if tally.ok == 0 && tally.failed > 0 {
            return Err("Failed to read any registry root".to_string());
        }
        Ok(entries)
    }

    fn capture_files(
        &self,
        roots: &[PathBuf],
        depth: usize,
        tally: &mut SourceTally,
        log: &mut PipelineLog,
    ) -> Vec<FileInfo> {
        let mut files = Vec::new();
        let mut seen = HashSet::new();

        for root in roots {
            if !root.exists() {
                log.info(COMPONENT, format!("Skipping missing path {}", root.display()));
                continue;
            }

            let mut root_failed = false;
            for item in WalkDir::new(root).min_depth(1).max_depth(depth) {
                let entry = match item {
                    Ok(entry) => entry,
                    Err(e) => {
                        if e.depth() == 0 {
                            root_failed = true;
                        }
                        log.warn(COMPONENT, format!("Skipping unreadable path: {}", e));
                        continue;
                    }
                };

                let metadata = match entry.metadata() {
                    Ok(m) => m,
                    Err(e) => {
                        log.warn(
                            COMPONENT,
                            format!("Skipping {}: {}", entry.path().display(), e),
                        );
                        continue;
                    }
                };

                let path = entry.path().to_string_lossy().to_string();
                if !seen.insert(identity_key(&path)) {
                    continue;
                }

                files.push(FileInfo {
                    path,
                    size: if metadata.is_dir() { 0 } else { metadata.len() },
                    created_at: metadata.created().ok().map(DateTime::<Utc>::from),
                    modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
                    is_directory: metadata.is_dir(),
                });
            }

            if root_failed {
                tally.failed += 1;
            } else {
                tally.ok += 1;
            }
        }

        files
    }

    fn collect_registry(
        &self,
        roots: &[String],
        depth: usize,
        tally: &mut SourceTally,
        log: &mut PipelineLog,
    ) -> Vec<RegistryEntry> {
        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for root in roots {
            let root = normalize_key_path(root);
            let data = match self.registry.read_key(&root) {
                Ok(Some(data)) => data,
                Ok(None) => {
                    log.info(COMPONENT, format!("Skipping missing registry root {}", root));
                    continue;
                }
                Err(e) => {
                    tally.failed += 1;
                    log.warn(COMPONENT, format!("Skipping registry root {}: {}", root, e));
                    continue;
                }
            };
            tally.ok += 1;

            let mut stack: Vec<(String, usize)> = data
                .subkeys
                .iter()
                .rev()
                .map(|child| (join_key(&root, child), 1))
                .collect();

            while let Some((path, level)) = stack.pop() {
                let key = match self.registry.read_key(&path) {
                    Ok(Some(key)) => key,
                    Ok(None) => continue,
                    Err(e) => {
                        log.warn(COMPONENT, format!("Skipping registry key {}: {}", path, e));
                        continue;
                    }
                };

                if level < depth {
                    for child in key.subkeys.iter().rev() {
                        stack.push((join_key(&path, child), level + 1));
                    }
                }

                if !seen.insert(identity_key(&path)) {
                    continue;
                }

                let values = key
                    .values
                    .into_iter()
                    .filter(|(name, _)| is_recordable_value(name))
                    .collect();
                entries.push(RegistryEntry::new(&path, values, key.subkeys.len()));
            }
        }

        entries
    }

    fn list_services(&self, tally: &mut SourceTally, log: &mut PipelineLog) -> Vec<ServiceInfo> {
        let root = match self.registry.read_key(SERVICES_ROOT) {
            Ok(Some(root)) => root,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tally.failed += 1;
                log.warn(COMPONENT, format!("Failed to list services: {}", e));
                return Vec::new();
            }
        };
        tally.ok += 1;

        let mut services = Vec::new();
        for name in &root.subkeys {
            let key = match self.registry.read_key(&join_key(SERVICES_ROOT, name)) {
                Ok(Some(key)) => key,
                _ => continue,
            };

            let service_type = number_value(&key.values, "Type").unwrap_or(0);
            if service_type & WIN32_SERVICE_TYPES == 0 {
                continue;
            }

            let display_name = text_value(&key.values, "DisplayName")
                .unwrap_or(name.as_str())
                .to_string();
            let start_type = start_type_name(number_value(&key.values, "Start"));
            let status = self
                .service_states
                .get(&identity_key(name))
                .cloned()
                .unwrap_or_else(|| "Unknown".to_string());

            services.push(ServiceInfo {
                name: name.clone(),
                display_name,
                status,
                start_type: start_type.to_string(),
            });
        }
        services
    }

    fn list_programs(&self, tally: &mut SourceTally, log: &mut PipelineLog) -> Vec<ProgramInfo> {
        let mut programs: Vec<ProgramInfo> = Vec::new();
        let mut seen = HashSet::new();

        for root in UNINSTALL_ROOTS {
            let data = match self.registry.read_key(root) {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    tally.failed += 1;
                    log.warn(COMPONENT, format!("Failed to list programs under {}: {}", root, e));
                    continue;
                }
            };
            tally.ok += 1;

            for child in &data.subkeys {
                let key = match self.registry.read_key(&join_key(root, child)) {
                    Ok(Some(key)) => key,
                    _ => continue,
                };
                let Some(name) = text_value(&key.values, "DisplayName") else {
                    continue;
                };
                if !seen.insert(identity_key(name)) {
                    continue;
                }
                programs.push(ProgramInfo {
                    name: name.to_string(),
                    version: text_value(&key.values, "DisplayVersion").unwrap_or_default().to_string(),
                    vendor: text_value(&key.values, "Publisher").unwrap_or_default().to_string(),
                    install_date: text_value(&key.values, "InstallDate").unwrap_or_default().to_string(),
                });
            }
        }
        programs
    }
}

fn number_value(values: &BTreeMap<String, RegistryValue>, name: &str) -> Option<u64> {
    values
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| match v {
            RegistryValue::Number(n) => Some(*n),
            _ => None,
        })
}

fn start_type_name(start: Option<u64>) -> &'static str {
    match start {
        Some(0) => "Boot",
        Some(1) => "System",
        Some(2) => "Automatic",
        Some(3) => "Manual",
        Some(4) => "Disabled",
        _ => "Unknown",
    }
}

/// Parse `sc query` output into service name -> status ("Running", "StopPending", ...).
pub fn parse_sc_query(output: &str) -> HashMap<String, String> {
    let mut states = HashMap::new();
    let mut current: Option<String> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_prefix("SERVICE_NAME:") {
            current = Some(name.trim().to_string());
        } else if trimmed.starts_with("STATE") {
            let Some(name) = current.take() else { continue };
            let state = trimmed
                .split(':')
                .nth(1)
                .and_then(|rest| rest.split_whitespace().nth(1))
                .unwrap_or("UNKNOWN");
            states.insert(name, pascal_case(state));
        }
    }
    states
}

fn pascal_case(state: &str) -> String {
    state
        .split('_')
        .filter(|p| !p.is_empty())
        .map(|part| {
            let lower = part.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Ask the service control manager for every service's state.
pub fn query_service_states() -> Result<HashMap<String, String>, String> {
    #[cfg(target_os = "windows")]
    {
        let output = hidden_command("sc")
            .args(["query", "type=", "service", "state=", "all"])
            .output()
            .map_err(|e| format!("Failed to run sc query: {}", e))?;
        Ok(parse_sc_query(&String::from_utf8_lossy(&output.stdout)))
    }
    #[cfg(not(target_os = "windows"))]
    {
        Ok(HashMap::new())
    }
}
