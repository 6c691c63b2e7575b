use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use super::differ::RawChanges;
use super::logs::PipelineLog;
use super::registry::is_recordable_value;
use super::snapshot::{identity_key, FileInfo, ProgramInfo, RegistryEntry, ServiceInfo};

const COMPONENT: &str = "change-record";

/// Current change set schema. Documents without a version are treated as 1.
pub const SCHEMA_VERSION: u64 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationInfo {
    #[serde(rename = "ProjectName")]
    pub project_name: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "DocumentationDate", default)]
    pub documentation_date: String,
    #[serde(rename = "SchemaVersion", default)]
    pub schema_version: u64,
}

/// The normalized diff of one install. Hand-off artifact between the differ
/// and the script generators; not modified after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(rename = "InstallationInfo")]
    pub info: InstallationInfo,
    #[serde(rename = "NewFiles", default)]
    pub new_files: Vec<FileInfo>,
    #[serde(rename = "ModifiedFiles", default)]
    pub modified_files: Vec<FileInfo>,
    #[serde(rename = "NewRegistryKeys", default)]
    pub new_registry_keys: Vec<RegistryEntry>,
    #[serde(rename = "NewServices", default)]
    pub new_services: Vec<ServiceInfo>,
    #[serde(rename = "NewPrograms", default)]
    pub new_programs: Vec<ProgramInfo>,
}

impl ChangeSet {
    pub fn project_name(&self) -> &str {
        &self.info.project_name
    }

    pub fn timestamp(&self) -> &str {
        &self.info.timestamp
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self).map_err(|e| format!("Failed to serialize change set: {}", e))
    }

    /// Parse a change set document, migrating older layouts first.
    pub fn from_json(text: &str) -> Result<Self, String> {
        let mut doc: Value =
            serde_json::from_str(text).map_err(|e| format!("Failed to parse change set: {}", e))?;

        let version = doc
            .pointer("/InstallationInfo/SchemaVersion")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        if version > SCHEMA_VERSION {
            return Err(format!(
                "Unsupported change set schema version {} (newest known is {})",
                version, SCHEMA_VERSION
            ));
        }
        if version < SCHEMA_VERSION {
            log::info!("Migrating change set from schema version {}", version);
            migrate_v1(&mut doc);
        }

        serde_json::from_value(doc).map_err(|e| format!("Invalid change set: {}", e))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read change set {}: {}", path.display(), e))?;
        Self::from_json(&content)
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let content = self.to_json()?;
        fs::write(path, content)
            .map_err(|e| format!("Failed to write change set {}: {}", path.display(), e))
    }
}

/// Turns raw diff output into a `ChangeSet`: drops records without identity,
/// drops duplicates (first one wins) and stamps project name and time.
pub struct ChangeSetBuilder {
    project_name: String,
}

impl ChangeSetBuilder {
    pub fn new(project_name: &str) -> Self {
        ChangeSetBuilder {
            project_name: project_name.trim().to_string(),
        }
    }

    pub fn build(&self, raw: RawChanges, captured_at: DateTime<Local>, log: &mut PipelineLog) -> ChangeSet {
        let mut dropped = 0;

        let new_files = keep_identified(raw.new_files, |f| &f.path, &mut dropped);
        let modified_files = keep_identified(raw.modified_files, |f| &f.path, &mut dropped);
        let new_registry_keys = keep_identified(raw.new_registry_keys, |k| &k.full_path, &mut dropped);
        let new_services = keep_identified(raw.new_services, |s| &s.name, &mut dropped);
        let new_programs = keep_identified(raw.new_programs, |p| &p.name, &mut dropped);

        if dropped > 0 {
            log.warn(
                COMPONENT,
                format!("Dropped {} records without identity or duplicated", dropped),
            );
        }

        log.info(
            COMPONENT,
            format!(
                "Change set '{}': {} new files, {} modified files, {} registry keys, {} services, {} programs",
                self.project_name,
                new_files.len(),
                modified_files.len(),
                new_registry_keys.len(),
                new_services.len(),
                new_programs.len()
            ),
        );

        ChangeSet {
            info: InstallationInfo {
                project_name: self.project_name.clone(),
                timestamp: captured_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                documentation_date: captured_at.format("%Y-%m-%d").to_string(),
                schema_version: SCHEMA_VERSION,
            },
            new_files,
            modified_files,
            new_registry_keys,
            new_services,
            new_programs,
        }
    }
}

fn keep_identified<T>(items: Vec<T>, identity: impl Fn(&T) -> &String, dropped: &mut usize) -> Vec<T> {
    let mut seen = HashSet::new();
    let before = items.len();
    let kept: Vec<T> = items
        .into_iter()
        .filter(|item| {
            let key = identity_key(identity(item));
            !key.is_empty() && seen.insert(key)
        })
        .collect();
    *dropped += before - kept.len();
    kept
}

// ─── Schema migration ─────────────────────────────────────────────

const ENTRY_FIELDS: [&str; 8] = [
    "Path",
    "FullPath",
    "KeyName",
    "ValueCount",
    "SubKeyCount",
    "Values",
    "Properties",
    "Inaccessible",
];

const LIST_FIELDS: [&str; 5] = ["NewFiles", "ModifiedFiles", "NewRegistryKeys", "NewServices", "NewPrograms"];

/// Bring a version 1 document (written by the older PowerShell tooling) to
/// the current layout.
fn migrate_v1(doc: &mut Value) {
    let Some(root) = doc.as_object_mut() else { return };

    // ConvertTo-Json collapses one-element arrays into a bare object.
    for field in LIST_FIELDS {
        let fixed = match root.remove(field) {
            Some(Value::Array(items)) => Value::Array(items),
            Some(Value::Null) | None => Value::Array(Vec::new()),
            Some(single) => Value::Array(vec![single]),
        };
        root.insert(field.to_string(), fixed);
    }

    for field in ["NewFiles", "ModifiedFiles"] {
        if let Some(Value::Array(files)) = root.get_mut(field) {
            files.iter_mut().for_each(migrate_file_entry);
        }
    }
    if let Some(Value::Array(keys)) = root.get_mut("NewRegistryKeys") {
        keys.iter_mut().for_each(migrate_registry_entry);
    }
    if let Some(Value::Array(services)) = root.get_mut("NewServices") {
        services.iter_mut().for_each(migrate_service_entry);
    }

    let info = root
        .entry("InstallationInfo")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(info) = info.as_object_mut() {
        info.entry("ProjectName").or_insert_with(|| Value::String(String::new()));
        info.entry("Timestamp").or_insert_with(|| Value::String(String::new()));
        info.insert("SchemaVersion".to_string(), Value::from(SCHEMA_VERSION));
    }
}

fn migrate_file_entry(file: &mut Value) {
    let Some(obj) = file.as_object_mut() else { return };
    for field in ["CreationTime", "LastWriteTime"] {
        if let Some(value) = obj.get(field) {
            let converted = value
                .as_str()
                .and_then(parse_legacy_time)
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null);
            obj.insert(field.to_string(), converted);
        }
    }
    if let Some(Value::Null) = obj.get("Length") {
        obj.insert("Length".to_string(), Value::from(0));
    }
}

/// Accepts `/Date(1697630400000)/`, RFC 3339 and offset-less ISO timestamps.
fn parse_legacy_time(text: &str) -> Option<DateTime<Utc>> {
    if let Some(ms) = text
        .strip_prefix("/Date(")
        .and_then(|rest| rest.strip_suffix(")/"))
    {
        let digits: String = ms.chars().take_while(|c| c.is_ascii_digit() || *c == '-').collect();
        let millis: i64 = digits.parse().ok()?;
        return Utc.timestamp_millis_opt(millis).single();
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Older tooling stored values either in a `Properties` object or flattened
/// directly onto the entry.
fn migrate_registry_entry(entry: &mut Value) {
    let Some(obj) = entry.as_object_mut() else { return };

    if !obj.contains_key("Path") {
        if let Some(path) = obj.remove("FullPath") {
            obj.insert("Path".to_string(), path);
        }
    }

    let has_values = matches!(obj.get("Values"), Some(Value::Object(v)) if !v.is_empty());
    if !has_values {
        let values: Map<String, Value> = match obj.get("Properties") {
            Some(Value::Object(props)) => props
                .iter()
                .filter(|(k, _)| is_recordable_value(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => obj
                .iter()
                .filter(|(k, _)| !ENTRY_FIELDS.contains(&k.as_str()) && is_recordable_value(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        for name in values.keys() {
            obj.remove(name);
        }
        obj.insert("Values".to_string(), Value::Object(values));
    }

    let count = obj
        .get("Values")
        .and_then(Value::as_object)
        .map(|v| v.len())
        .unwrap_or(0);
    if !matches!(obj.get("Properties"), Some(Value::String(_))) {
        obj.insert("Properties".to_string(), Value::String(format!("{} properties", count)));
    }
    if !obj.contains_key("ValueCount") {
        obj.insert("ValueCount".to_string(), Value::from(count));
    }
    if !obj.contains_key("KeyName") {
        let key_name = obj
            .get("Path")
            .and_then(Value::as_str)
            .and_then(|p| p.rsplit('\\').next())
            .unwrap_or_default()
            .to_string();
        obj.insert("KeyName".to_string(), Value::String(key_name));
    }
}

/// `Get-Service | ConvertTo-Json` writes enum members as numbers.
fn migrate_service_entry(service: &mut Value) {
    let Some(obj) = service.as_object_mut() else { return };

    if let Some(code) = obj.get("Status").and_then(Value::as_u64) {
        let status = match code {
            1 => "Stopped",
            2 => "StartPending",
            3 => "StopPending",
            4 => "Running",
            5 => "ContinuePending",
            6 => "PausePending",
            7 => "Paused",
            _ => "Unknown",
        };
        obj.insert("Status".to_string(), Value::String(status.to_string()));
    }
    if let Some(code) = obj.get("StartType").and_then(Value::as_u64) {
        let start = match code {
            0 => "Boot",
            1 => "System",
            2 => "Automatic",
            3 => "Manual",
            4 => "Disabled",
            _ => "Unknown",
        };
        obj.insert("StartType".to_string(), Value::String(start.to_string()));
    }
}
