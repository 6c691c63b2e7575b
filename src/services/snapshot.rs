use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// A single registry value as it appears in snapshots and change sets.
///
/// Untagged so the JSON stays a plain `name -> value` mapping; anything that
/// does not fit the typed variants (e.g. negative numbers written by other
/// tools) is preserved verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegistryValue {
    Text(String),
    Number(u64),
    List(Vec<String>),
    Bytes(Vec<u8>),
    Other(serde_json::Value),
}

impl RegistryValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RegistryValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<&str> for RegistryValue {
    fn from(value: &str) -> Self {
        RegistryValue::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(rename = "FullName")]
    pub path: String,
    #[serde(rename = "Length", default)]
    pub size: u64,
    #[serde(rename = "CreationTime", default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(rename = "LastWriteTime", default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(rename = "IsDirectory", alias = "PSIsContainer", default)]
    pub is_directory: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    #[serde(rename = "Path")]
    pub full_path: String,
    #[serde(rename = "KeyName", default)]
    pub key_name: String,
    #[serde(rename = "ValueCount", default)]
    pub value_count: usize,
    #[serde(rename = "SubKeyCount", default)]
    pub sub_key_count: usize,
    #[serde(rename = "Values", default)]
    pub values: BTreeMap<String, RegistryValue>,
    #[serde(rename = "Properties", default)]
    pub properties: String,
    /// Set when the values could not be re-read at diff time.
    #[serde(rename = "Inaccessible", default, skip_serializing_if = "is_false")]
    pub inaccessible: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl RegistryEntry {
    pub fn new(
        full_path: &str,
        values: BTreeMap<String, RegistryValue>,
        sub_key_count: usize,
    ) -> Self {
        let key_name = full_path
            .rsplit('\\')
            .next()
            .unwrap_or(full_path)
            .to_string();
        let value_count = values.len();
        RegistryEntry {
            full_path: full_path.to_string(),
            key_name,
            value_count,
            sub_key_count,
            properties: format!("{} properties", value_count),
            values,
            inaccessible: false,
        }
    }

    pub fn text_value(&self, name: &str) -> Option<&str> {
        text_value(&self.values, name)
    }

    pub fn display_name(&self) -> Option<&str> {
        self.text_value("DisplayName")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "DisplayName", default)]
    pub display_name: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "StartType", default)]
    pub start_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "Vendor", default)]
    pub vendor: String,
    #[serde(rename = "InstallDate", default)]
    pub install_date: String,
}

/// Point-in-time listing of files, registry keys, services and programs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    #[serde(rename = "CapturedAt", default)]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(rename = "Files", default)]
    pub files: Vec<FileInfo>,
    #[serde(rename = "RegistryEntries", default)]
    pub registry_entries: Vec<RegistryEntry>,
    #[serde(rename = "Services", default)]
    pub services: Vec<ServiceInfo>,
    #[serde(rename = "Programs", default)]
    pub programs: Vec<ProgramInfo>,
}

impl SystemSnapshot {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read snapshot {}: {}", path.display(), e))?;

        serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse snapshot {}: {}", path.display(), e))
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize snapshot: {}", e))?;

        fs::write(path, content)
            .map_err(|e| format!("Failed to write snapshot {}: {}", path.display(), e))
    }
}

/// Identity used for set operations. Windows paths and names compare
/// case-insensitively.
pub fn identity_key(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Get a string value by name, ignoring case. Empty strings count as absent.
pub fn text_value<'v>(values: &'v BTreeMap<String, RegistryValue>, name: &str) -> Option<&'v str> {
    values
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.as_text())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
