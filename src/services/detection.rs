use std::collections::HashMap;

use super::candidates::{detection_product_codes, reference_identity, AppIdentity, GenerateError};
use super::change_record::ChangeSet;
use super::registry::{join_key, RegistrySource, UNINSTALL_ROOTS};
use super::snapshot::RegistryEntry;
use super::templates::{TemplateEngine, DETECTION_TEMPLATE};
use super::validation::{escape_for_powershell, powershell_array};
use super::version::requirement_met;

/// What a detection check looks for, derived from a change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionPlan {
    pub identity: AppIdentity,
    pub product_codes: Vec<String>,
}

impl DetectionPlan {
    pub fn from_change_set(change_set: &ChangeSet) -> Result<Self, GenerateError> {
        let identity = reference_identity(&change_set.new_registry_keys)?;
        let product_codes = detection_product_codes(&change_set.new_registry_keys);
        Ok(DetectionPlan {
            identity,
            product_codes,
        })
    }

    pub fn required_version(&self) -> Option<&str> {
        self.identity.version.as_deref()
    }

    /// Loose display-name match: exact name, or contains the name's first token.
    pub fn name_matches(&self, display_name: &str) -> bool {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return false;
        }
        if display_name == self.identity.name {
            return true;
        }
        display_name
            .to_lowercase()
            .contains(&self.identity.name_token().to_lowercase())
    }
}

/// Result of evaluating detection natively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionResult {
    pub found: bool,
    pub installed_version: Option<String>,
    pub matched_path: Option<String>,
    pub requirement_met: bool,
}

impl DetectionResult {
    pub fn exit_code(&self) -> i32 {
        if self.requirement_met {
            0
        } else {
            1
        }
    }
}

pub struct DetectionScriptGenerator;

impl DetectionScriptGenerator {
    /// Render the detection script for a change set.
    ///
    /// Output depends only on the change set, so generating twice yields the
    /// same text.
    pub fn generate(change_set: &ChangeSet) -> Result<String, GenerateError> {
        let plan = DetectionPlan::from_change_set(change_set)?;

        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("app_name", escape_for_powershell(&plan.identity.name)?);
        vars.insert("name_token", escape_for_powershell(plan.identity.name_token())?);
        vars.insert(
            "required_version",
            escape_for_powershell(plan.required_version().unwrap_or_default())?,
        );
        vars.insert("product_codes", powershell_array(&plan.product_codes)?);
        vars.insert("project_name", escape_for_powershell(change_set.project_name())?);
        vars.insert("timestamp", escape_for_powershell(change_set.timestamp())?);

        log::info!(
            "Generated detection script for '{}' ({} product codes)",
            plan.identity.name,
            plan.product_codes.len()
        );
        Ok(TemplateEngine::render(DETECTION_TEMPLATE, &vars))
    }

    /// Run the detection logic of the generated script against `registry`.
    pub fn evaluate(
        change_set: &ChangeSet,
        registry: &dyn RegistrySource,
    ) -> Result<DetectionResult, GenerateError> {
        let plan = DetectionPlan::from_change_set(change_set)?;
        Ok(evaluate_plan(&plan, registry))
    }
}

/// Product codes first, then a display-name scan of every uninstall root.
/// Unreadable keys are skipped.
pub fn evaluate_plan(plan: &DetectionPlan, registry: &dyn RegistrySource) -> DetectionResult {
    let matched = find_by_product_code(plan, registry).or_else(|| find_by_name(plan, registry));

    let Some(entry) = matched else {
        log::info!("'{}' not detected", plan.identity.name);
        return DetectionResult {
            found: false,
            installed_version: None,
            matched_path: None,
            requirement_met: false,
        };
    };

    let installed_version = entry.text_value("DisplayVersion").map(str::to_string);
    let met = match (installed_version.as_deref(), plan.required_version()) {
        (Some(installed), Some(required)) => requirement_met(installed, required),
        _ => true,
    };
    log::info!(
        "'{}' detected at {} (version {})",
        plan.identity.name,
        entry.full_path,
        installed_version.as_deref().unwrap_or("unknown")
    );

    DetectionResult {
        found: true,
        installed_version,
        matched_path: Some(entry.full_path),
        requirement_met: met,
    }
}

fn read_entry(registry: &dyn RegistrySource, path: &str) -> Option<RegistryEntry> {
    match registry.read_key(path) {
        Ok(Some(data)) => Some(RegistryEntry::new(path, data.values, data.subkeys.len())),
        Ok(None) => None,
        Err(e) => {
            log::warn!("Skipping unreadable key {}: {}", path, e);
            None
        }
    }
}

fn find_by_product_code(plan: &DetectionPlan, registry: &dyn RegistrySource) -> Option<RegistryEntry> {
    plan.product_codes.iter().find_map(|code| {
        UNINSTALL_ROOTS.iter().find_map(|root| {
            read_entry(registry, &join_key(root, code))
                .filter(|e| e.display_name().map_or(false, |n| plan.name_matches(n)))
        })
    })
}

fn find_by_name(plan: &DetectionPlan, registry: &dyn RegistrySource) -> Option<RegistryEntry> {
    UNINSTALL_ROOTS.iter().find_map(|root| {
        let subkeys = match registry.read_key(root) {
            Ok(Some(data)) => data.subkeys,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Skipping unreadable uninstall root {}: {}", root, e);
                return None;
            }
        };
        subkeys.iter().find_map(|name| {
            read_entry(registry, &join_key(root, name))
                .filter(|e| e.display_name().map_or(false, |n| plan.name_matches(n)))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::change_record::InstallationInfo;
    use crate::services::registry::MemoryRegistry;
    use crate::services::snapshot::RegistryValue;
    use std::collections::BTreeMap;

    const CODE: &str = "{AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE}";
    const HKLM_UNINSTALL: &str = r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall";
    const HKCU_UNINSTALL: &str = r"HKCU\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall";

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, RegistryValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), RegistryValue::from(*v)))
            .collect()
    }

    fn change_set(entries: Vec<RegistryEntry>) -> ChangeSet {
        ChangeSet {
            info: InstallationInfo {
                project_name: "Contoso".to_string(),
                timestamp: "2026-10-18 12:00:00".to_string(),
                documentation_date: "2026-10-18".to_string(),
                schema_version: 2,
            },
            new_files: Vec::new(),
            modified_files: Vec::new(),
            new_registry_keys: entries,
            new_services: Vec::new(),
            new_programs: Vec::new(),
        }
    }

    fn contoso_change_set(version: &str) -> ChangeSet {
        change_set(vec![RegistryEntry::new(
            &format!(r"{}\{}", HKLM_UNINSTALL, CODE),
            values(&[
                ("DisplayName", "Contoso App"),
                ("DisplayVersion", version),
                ("UninstallString", "MsiExec.exe /X{AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE}"),
            ]),
            0,
        )])
    }

    fn installed(registry: &mut MemoryRegistry, root: &str, key: &str, name: &str, version: &str) {
        registry.set_key(
            &format!(r"{}\{}", root, key),
            values(&[("DisplayName", name), ("DisplayVersion", version)]),
        );
    }

    #[test]
    fn test_generate_contoso_script() {
        let script = DetectionScriptGenerator::generate(&contoso_change_set("3.2.0")).unwrap();

        assert!(script.contains("$AppName = 'Contoso App'"));
        assert!(script.contains("$NameToken = 'Contoso'"));
        assert!(script.contains("$RequiredVersion = '3.2.0'"));
        assert!(script.contains(&format!("$ProductCodes = @('{}')", CODE)));
        assert!(script.contains("exit 1"));
        assert!(script.contains("exit 0"));
        assert!(!script.contains("{{"));
    }

    #[test]
    fn test_generate_is_idempotent() {
        let change_set = contoso_change_set("3.2.0");
        let first = DetectionScriptGenerator::generate(&change_set).unwrap();
        let second = DetectionScriptGenerator::generate(&change_set).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_generate_without_application_fails() {
        let stray = RegistryEntry::new(r"HKLM\SOFTWARE\Contoso", values(&[("DisplayName", "Contoso")]), 0);
        assert_eq!(
            DetectionScriptGenerator::generate(&change_set(vec![stray])),
            Err(GenerateError::NoApplicationFound)
        );
        assert_eq!(
            DetectionScriptGenerator::generate(&change_set(Vec::new())),
            Err(GenerateError::NoApplicationFound)
        );
    }

    #[test]
    fn test_generate_escapes_quotes() {
        let entry = RegistryEntry::new(
            &format!(r"{}\OBrien", HKLM_UNINSTALL),
            values(&[("DisplayName", "O'Brien Tools")]),
            0,
        );
        let script = DetectionScriptGenerator::generate(&change_set(vec![entry])).unwrap();
        assert!(script.contains("$AppName = 'O''Brien Tools'"));
        assert!(script.contains("$ProductCodes = @()"));
    }

    #[test]
    fn test_evaluate_finds_product_code_first() {
        let mut registry = MemoryRegistry::new();
        installed(&mut registry, HKLM_UNINSTALL, CODE, "Contoso App", "3.2.0");
        installed(&mut registry, HKCU_UNINSTALL, "ContosoUser", "Contoso App", "1.0");

        let result = DetectionScriptGenerator::evaluate(&contoso_change_set("3.2.0"), &registry).unwrap();
        assert!(result.found);
        assert_eq!(result.installed_version.as_deref(), Some("3.2.0"));
        assert!(result.matched_path.as_deref().unwrap().ends_with(CODE));
        assert_eq!(result.exit_code(), 0);
    }

    #[test]
    fn test_evaluate_product_code_needs_name_match() {
        let mut registry = MemoryRegistry::new();
        installed(&mut registry, HKLM_UNINSTALL, CODE, "Something Else", "9.9");

        let result = DetectionScriptGenerator::evaluate(&contoso_change_set("3.2.0"), &registry).unwrap();
        assert!(!result.found);
        assert_eq!(result.exit_code(), 1);
    }

    #[test]
    fn test_evaluate_falls_back_to_name_scan() {
        let mut registry = MemoryRegistry::new();
        installed(&mut registry, HKCU_UNINSTALL, "ContosoPerUser", "Contoso App (user)", "3.2.0");

        let result = DetectionScriptGenerator::evaluate(&contoso_change_set("3.2.0"), &registry).unwrap();
        assert!(result.found);
        assert!(result.requirement_met);
    }

    #[test]
    fn test_evaluate_version_rules() {
        let cases = [("2.1.0", "2.0.5", 0), ("1.9", "2.0", 1), ("abc", "2.0", 0)];
        for (installed_version, required, expected) in cases {
            let mut registry = MemoryRegistry::new();
            installed(&mut registry, HKLM_UNINSTALL, CODE, "Contoso App", installed_version);

            let result =
                DetectionScriptGenerator::evaluate(&contoso_change_set(required), &registry).unwrap();
            assert!(result.found);
            assert_eq!(result.exit_code(), expected, "{} vs {}", installed_version, required);
        }
    }

    #[test]
    fn test_evaluate_skips_unreadable_root() {
        let mut registry = MemoryRegistry::new();
        registry.deny(HKLM_UNINSTALL);
        installed(&mut registry, HKCU_UNINSTALL, "Contoso", "Contoso App", "3.2.0");

        let result = DetectionScriptGenerator::evaluate(&contoso_change_set("3.2.0"), &registry).unwrap();
        assert!(result.found);
        assert!(result.matched_path.unwrap().starts_with("HKCU"));
    }

    #[test]
    fn test_name_matches() {
        let plan = DetectionPlan::from_change_set(&contoso_change_set("1.0")).unwrap();
        assert!(plan.name_matches("Contoso App"));
        assert!(plan.name_matches("contoso app 2024"));
        assert!(!plan.name_matches("Fabrikam"));
        assert!(!plan.name_matches("   "));
    }
}
