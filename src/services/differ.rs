use std::collections::{HashMap, HashSet};

use super::logs::PipelineLog;
use super::registry::{is_recordable_value, RegistrySource};
use super::retry::{retry_until, RetryPolicy, Sleeper};
use super::snapshot::{
    identity_key, FileInfo, ProgramInfo, RegistryEntry, ServiceInfo, SystemSnapshot,
};

const COMPONENT: &str = "differ";

/// Unvalidated diff output, input to the change record builder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawChanges {
    pub new_files: Vec<FileInfo>,
    pub modified_files: Vec<FileInfo>,
    pub new_registry_keys: Vec<RegistryEntry>,
    pub new_services: Vec<ServiceInfo>,
    pub new_programs: Vec<ProgramInfo>,
}

impl RawChanges {
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty()
            && self.modified_files.is_empty()
            && self.new_registry_keys.is_empty()
            && self.new_services.is_empty()
            && self.new_programs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffOutcome {
    pub changes: RawChanges,
    /// Registry re-captures performed after the first attempt.
    pub registry_retries: u32,
    /// False when every attempt came back without new registry keys.
    pub registry_settled: bool,
}

pub struct SnapshotDiffer<'a> {
    /// Live registry for re-reads. `None` diffs the snapshots as captured.
    registry: Option<&'a dyn RegistrySource>,
    policy: RetryPolicy,
    sleeper: &'a dyn Sleeper,
}

impl<'a> SnapshotDiffer<'a> {
    pub fn new(registry: &'a dyn RegistrySource, policy: RetryPolicy, sleeper: &'a dyn Sleeper) -> Self {
        SnapshotDiffer {
            registry: Some(registry),
            policy,
            sleeper,
        }
    }

    /// Differ for snapshots taken on another host: a single registry attempt
    /// and no re-reads, so new keys keep their captured values.
    pub fn offline(sleeper: &'a dyn Sleeper) -> Self {
        SnapshotDiffer {
            registry: None,
            policy: RetryPolicy {
                attempts: 1,
                ..RetryPolicy::default()
            },
            sleeper,
        }
    }

    /// Diff two snapshots.
    ///
    /// `recapture_registry` is called for registry attempts after the first one,
    /// which uses `post` as given. Installers sometimes write their uninstall
    /// keys after the main process has exited.
    pub fn diff(
        &self,
        pre: &SystemSnapshot,
        post: &SystemSnapshot,
        mut recapture_registry: impl FnMut() -> Result<Vec<RegistryEntry>, String>,
        log: &mut PipelineLog,
    ) -> DiffOutcome {
        let (new_files, modified_files) = file_changes(&pre.files, &post.files);
        log.info(
            COMPONENT,
            format!("{} new files, {} modified files", new_files.len(), modified_files.len()),
        );

        let outcome = retry_until(
            self.policy,
            self.sleeper,
            |attempt| {
                if attempt == 1 {
                    return registry_difference(&pre.registry_entries, &post.registry_entries);
                }
                log.info(
                    COMPONENT,
                    format!("No new registry keys yet, re-capturing (attempt {})", attempt),
                );
                match recapture_registry() {
                    Ok(entries) => registry_difference(&pre.registry_entries, &entries),
                    Err(e) => {
                        log.warn(COMPONENT, format!("Registry re-capture failed: {}", e));
                        Vec::new()
                    }
                }
            },
            |keys: &Vec<RegistryEntry>| !keys.is_empty(),
        );

        if !outcome.accepted {
            log.warn(
                COMPONENT,
                format!("No new registry keys after {} attempts", outcome.attempts),
            );
        }

        let registry_retries = outcome.retries();
        let registry_settled = outcome.accepted;
        let new_registry_keys: Vec<RegistryEntry> = outcome
            .value
            .into_iter()
            .map(|entry| self.refresh_entry(entry, log))
            .collect();

        let new_services = name_difference(&pre.services, &post.services, |s| &s.name);
        let new_programs = name_difference(&pre.programs, &post.programs, |p| &p.name);

        log.info(
            COMPONENT,
            format!(
                "{} new registry keys, {} new services, {} new programs",
                new_registry_keys.len(),
                new_services.len(),
                new_programs.len()
            ),
        );

        DiffOutcome {
            changes: RawChanges {
                new_files,
                modified_files,
                new_registry_keys,
                new_services,
                new_programs,
            },
            registry_retries,
            registry_settled,
        }
    }

    /// Re-read a key's values so the change set carries the freshest state.
    /// Keys that cannot be read keep their captured values and are marked.
    fn refresh_entry(&self, entry: RegistryEntry, log: &mut PipelineLog) -> RegistryEntry {
        let Some(registry) = self.registry else {
            return entry;
        };
        match registry.read_key(&entry.full_path) {
            Ok(Some(data)) => {
                let values = data
                    .values
                    .into_iter()
                    .filter(|(name, _)| is_recordable_value(name))
                    .collect();
                RegistryEntry::new(&entry.full_path, values, data.subkeys.len())
            }
            Ok(None) => {
                log.warn(
                    COMPONENT,
                    format!("Registry key vanished before re-read: {}", entry.full_path),
                );
                RegistryEntry {
                    inaccessible: true,
                    ..entry
                }
            }
            Err(e) => {
                log.warn(
                    COMPONENT,
                    format!("Registry key {} is inaccessible: {}", entry.full_path, e),
                );
                RegistryEntry {
                    inaccessible: true,
                    ..entry
                }
            }
        }
    }
}

/// New and modified files. Paths compare case-insensitively.
pub fn file_changes(pre: &[FileInfo], post: &[FileInfo]) -> (Vec<FileInfo>, Vec<FileInfo>) {
    let before: HashMap<String, &FileInfo> =
        pre.iter().map(|f| (identity_key(&f.path), f)).collect();

    let mut new_files = Vec::new();
    let mut modified_files = Vec::new();
    for file in post {
        match before.get(&identity_key(&file.path)) {
            None => new_files.push(file.clone()),
            Some(old) => {
                if let (Some(then), Some(now)) = (old.modified_at, file.modified_at) {
                    if now > then {
                        modified_files.push(file.clone());
                    }
                }
            }
        }
    }
    (new_files, modified_files)
}

pub fn registry_difference(pre: &[RegistryEntry], post: &[RegistryEntry]) -> Vec<RegistryEntry> {
    let before: HashSet<String> = pre.iter().map(|e| identity_key(&e.full_path)).collect();
    post.iter()
        .filter(|e| !before.contains(&identity_key(&e.full_path)))
        .cloned()
        .collect()
}

fn name_difference<T: Clone>(pre: &[T], post: &[T], name: impl Fn(&T) -> &String) -> Vec<T> {
    let before: HashSet<String> = pre.iter().map(|item| identity_key(name(item))).collect();
    post.iter()
        .filter(|item| !before.contains(&identity_key(name(item))))
        .cloned()
        .collect()
}
