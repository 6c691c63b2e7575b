use std::collections::{BTreeMap, BTreeSet};

use super::snapshot::{identity_key, RegistryValue};

/// Uninstall-key roots checked by detection and used for program listings.
pub const UNINSTALL_ROOTS: [&str; 3] = [
    r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall",
    r"HKLM\SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall",
    r"HKCU\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall",
];

pub const APP_PATHS_ROOTS: [&str; 3] = [
    r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\App Paths",
    r"HKLM\SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\App Paths",
    r"HKCU\SOFTWARE\Microsoft\Windows\CurrentVersion\App Paths",
];

pub const SERVICES_ROOT: &str = r"HKLM\SYSTEM\CurrentControlSet\Services";

/// Values PowerShell adds to every registry item; never part of the key itself.
const META_PROPERTIES: [&str; 5] = ["PSPath", "PSParentPath", "PSChildName", "PSDrive", "PSProvider"];

/// Contents of one registry key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyData {
    pub subkeys: Vec<String>,
    pub values: BTreeMap<String, RegistryValue>,
}

/// Read access to a registry.
///
/// `Ok(None)` means the key does not exist, which callers treat as "skip".
/// `Err` means the key exists but could not be read (permission denied).
pub trait RegistrySource {
    fn read_key(&self, path: &str) -> Result<Option<KeyData>, String>;
}

/// Whether a value name is a real registry value worth recording.
pub fn is_recordable_value(name: &str) -> bool {
    !name.is_empty() && !META_PROPERTIES.iter().any(|m| m.eq_ignore_ascii_case(name))
}

/// True for keys *below* one of the [`UNINSTALL_ROOTS`], i.e. one
/// application's entry. Vendor keys that merely contain `\Uninstall\` do not
/// count.
pub fn is_uninstall_key(path: &str) -> bool {
    let path = normalize_key_path(path);
    UNINSTALL_ROOTS.iter().any(|root| {
        path.get(..root.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(root))
            && path[root.len()..]
                .strip_prefix('\\')
                .is_some_and(|child| !child.is_empty())
    })
}

pub fn join_key(parent: &str, child: &str) -> String {
    format!("{}\\{}", parent.trim_end_matches('\\'), child)
}

/// Normalize `HKLM:\...` / `HKEY_LOCAL_MACHINE\...` to the short `HKLM\...` form.
pub fn normalize_key_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('\\');
    let (hive, rest) = match trimmed.find('\\') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos..]),
        None => (trimmed, ""),
    };
    let hive = hive.trim_end_matches(':').to_uppercase();
    let short = match hive.as_str() {
        "HKEY_LOCAL_MACHINE" => "HKLM",
        "HKEY_CURRENT_USER" => "HKCU",
        "HKEY_CLASSES_ROOT" => "HKCR",
        "HKEY_USERS" => "HKU",
        other => other,
    };
    format!("{}{}", short, rest)
}

/// In-memory registry. Used as the registry on non-Windows hosts and as a
/// controllable fake in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    keys: BTreeMap<String, (String, BTreeMap<String, RegistryValue>)>,
    denied: BTreeSet<String>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a key with the given values.
    pub fn set_key(&mut self, path: &str, values: BTreeMap<String, RegistryValue>) {
        let path = normalize_key_path(path);
        self.keys.insert(identity_key(&path), (path, values));
    }

    pub fn set_value(&mut self, path: &str, name: &str, value: RegistryValue) {
        let path = normalize_key_path(path);
        let entry = self
            .keys
            .entry(identity_key(&path))
            .or_insert_with(|| (path.clone(), BTreeMap::new()));
        entry.1.insert(name.to_string(), value);
    }

    /// Remove a key and everything below it.
    pub fn remove_key(&mut self, path: &str) {
        let key = identity_key(&normalize_key_path(path));
        let prefix = format!("{}\\", key);
        self.keys.retain(|k, _| *k != key && !k.starts_with(&prefix));
    }

    /// Make reads of this key fail as if access were denied.
    pub fn deny(&mut self, path: &str) {
        self.denied.insert(identity_key(&normalize_key_path(path)));
    }
}

impl RegistrySource for MemoryRegistry {
    fn read_key(&self, path: &str) -> Result<Option<KeyData>, String> {
        let path = normalize_key_path(path);
        let key = identity_key(&path);
        if self.denied.contains(&key) {
            return Err(format!("Access denied: {}", path));
        }

        let prefix = format!("{}\\", key);
        let mut subkeys: Vec<String> = Vec::new();
        for (k, (original, _)) in self.keys.range(prefix.clone()..) {
            if !k.starts_with(&prefix) {
                break;
            }
            let child = original
                .get(prefix.len()..)
                .and_then(|rest| rest.split('\\').next())
                .unwrap_or_default();
            if !child.is_empty() && !subkeys.iter().any(|s| s.eq_ignore_ascii_case(child)) {
                subkeys.push(child.to_string());
            }
        }

        match self.keys.get(&key) {
            Some((_, values)) => Ok(Some(KeyData {
                subkeys,
                values: values.clone(),
            })),
            None if !subkeys.is_empty() => Ok(Some(KeyData {
                subkeys,
                values: BTreeMap::new(),
            })),
            None => Ok(None),
        }
    }
}

#[cfg(target_os = "windows")]
pub use windows_impl::WindowsRegistry;

#[cfg(target_os = "windows")]
mod windows_impl {
    use super::{normalize_key_path, KeyData, RegistrySource};
    use crate::services::snapshot::RegistryValue;
    use std::collections::BTreeMap;
    use winreg::enums::*;
    use winreg::types::FromRegValue;
    use winreg::{RegKey, RegValue};

    /// Live registry access through winreg.
    pub struct WindowsRegistry;

    fn open_hive(hive: &str) -> Result<RegKey, String> {
        let predef = match hive {
            "HKLM" => HKEY_LOCAL_MACHINE,
            "HKCU" => HKEY_CURRENT_USER,
            "HKCR" => HKEY_CLASSES_ROOT,
            "HKU" => HKEY_USERS,
            other => return Err(format!("Unsupported registry hive: {}", other)),
        };
        Ok(RegKey::predef(predef))
    }

    fn convert(value: &RegValue) -> RegistryValue {
        match value.vtype {
            REG_SZ | REG_EXPAND_SZ => String::from_reg_value(value)
                .map(RegistryValue::Text)
                .unwrap_or_else(|_| RegistryValue::Bytes(value.bytes.to_vec())),
            REG_DWORD => u32::from_reg_value(value)
                .map(|n| RegistryValue::Number(n as u64))
                .unwrap_or_else(|_| RegistryValue::Bytes(value.bytes.to_vec())),
            REG_QWORD => u64::from_reg_value(value)
                .map(RegistryValue::Number)
                .unwrap_or_else(|_| RegistryValue::Bytes(value.bytes.to_vec())),
            REG_MULTI_SZ => Vec::<String>::from_reg_value(value)
                .map(RegistryValue::List)
                .unwrap_or_else(|_| RegistryValue::Bytes(value.bytes.to_vec())),
            _ => RegistryValue::Bytes(value.bytes.to_vec()),
        }
    }

    impl RegistrySource for WindowsRegistry {
        fn read_key(&self, path: &str) -> Result<Option<KeyData>, String> {
            let path = normalize_key_path(path);
            let (hive, sub) = match path.find('\\') {
                Some(pos) => (&path[..pos], &path[pos + 1..]),
                None => (path.as_str(), ""),
            };
            let root = open_hive(hive)?;

            let key = match root.open_subkey_with_flags(sub, KEY_READ) {
                Ok(key) => key,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(format!("Failed to open {}: {}", path, e)),
            };

            let subkeys = key.enum_keys().filter_map(|k| k.ok()).collect();

            let mut values = BTreeMap::new();
            for item in key.enum_values() {
                match item {
                    Ok((name, value)) => {
                        values.insert(name, convert(&value));
                    }
                    Err(e) => log::debug!("Skipping unreadable value under {}: {}", path, e),
                }
            }

            Ok(Some(KeyData { subkeys, values }))
        }
    }
}

/// The registry of the current host. Non-Windows hosts get an empty one.
pub fn system_registry() -> Box<dyn RegistrySource> {
    #[cfg(target_os = "windows")]
    {
        Box::new(WindowsRegistry)
    }
    #[cfg(not(target_os = "windows"))]
    {
        log::warn!("No Windows registry on this host; registry reads will be empty");
        Box::new(MemoryRegistry::new())
    }
}
