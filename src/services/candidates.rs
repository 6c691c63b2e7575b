use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use super::registry::is_uninstall_key;
use super::snapshot::RegistryEntry;
use super::validation::ValidationError;

static PRODUCT_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}\}")
        .expect("product code pattern is valid")
});

/// Errors a script generator can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateError {
    /// No uninstall-key entry in the change set carries a display name.
    NoApplicationFound,
    /// A value could not be embedded safely in the generated script.
    InvalidInput(String),
}

impl std::fmt::Display for GenerateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerateError::NoApplicationFound => {
                write!(f, "No application found: no uninstall entry with a display name")
            }
            GenerateError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

impl std::error::Error for GenerateError {}

impl From<ValidationError> for GenerateError {
    fn from(e: ValidationError) -> Self {
        GenerateError::InvalidInput(e.0)
    }
}

/// The application a change set is about, as seen in its uninstall entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub name: String,
    pub version: Option<String>,
    pub publisher: Option<String>,
    pub registry_path: String,
}

impl AppIdentity {
    /// First whitespace-separated token of the name, used for loose matching.
    pub fn name_token(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }
}

/// Pick the reference application: the first uninstall entry with a name,
/// version and publisher, else the first with just a name.
pub fn reference_identity(entries: &[RegistryEntry]) -> Result<AppIdentity, GenerateError> {
    let named: Vec<&RegistryEntry> = entries
        .iter()
        .filter(|e| is_uninstall_key(&e.full_path) && e.display_name().is_some())
        .collect();

    let entry = named
        .iter()
        .find(|e| e.text_value("DisplayVersion").is_some() && e.text_value("Publisher").is_some())
        .or_else(|| named.first())
        .ok_or(GenerateError::NoApplicationFound)?;

    Ok(AppIdentity {
        name: entry.display_name().unwrap_or_default().to_string(),
        version: entry.text_value("DisplayVersion").map(str::to_string),
        publisher: entry.text_value("Publisher").map(str::to_string),
        registry_path: entry.full_path.clone(),
    })
}

/// All product codes in `text`, uppercased, in order of appearance.
pub fn extract_product_codes(text: &str) -> Vec<String> {
    PRODUCT_CODE
        .find_iter(text)
        .map(|m| m.as_str().to_uppercase())
        .collect()
}

fn is_uninstall_string_name(name: &str) -> bool {
    name.to_lowercase().ends_with("uninstallstring")
}

fn push_unique(codes: &mut Vec<String>, seen: &mut HashSet<String>, found: Vec<String>) {
    for code in found {
        if seen.insert(code.clone()) {
            codes.push(code);
        }
    }
}

/// Product codes from registry paths and uninstall-string values, deduplicated.
/// Drives the exact-match pass of detection.
pub fn detection_product_codes(entries: &[RegistryEntry]) -> Vec<String> {
    let mut codes = Vec::new();
    let mut seen = HashSet::new();
    for entry in entries {
        push_unique(&mut codes, &mut seen, extract_product_codes(&entry.full_path));
        for (name, value) in &entry.values {
            if !is_uninstall_string_name(name) {
                continue;
            }
            if let Some(text) = value.as_text() {
                push_unique(&mut codes, &mut seen, extract_product_codes(text));
            }
        }
    }
    codes
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UninstallCandidate {
    Msi { product_code: String },
    Exe { command: String, arguments: String },
}

impl UninstallCandidate {
    pub fn is_msi(&self) -> bool {
        matches!(self, UninstallCandidate::Msi { .. })
    }
}

/// Classify one uninstall string.
///
/// Anything mentioning `msiexec` is MSI and needs an embedded product code;
/// an msiexec string without one yields nothing.
pub fn parse_uninstall_string(raw: &str) -> Option<UninstallCandidate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.to_lowercase().contains("msiexec") {
        return extract_product_codes(raw)
            .into_iter()
            .next()
            .map(|product_code| UninstallCandidate::Msi { product_code });
    }
    let (command, arguments) = split_command(raw);
    if command.is_empty() {
        return None;
    }
    Some(UninstallCandidate::Exe { command, arguments })
}

/// Split a command line into executable and argument string.
///
/// Handles `"C:\Program Files\App\u.exe" /S`, unquoted paths with spaces up
/// to `.exe`, and plain `tool args` forms.
pub fn split_command(raw: &str) -> (String, String) {
    let raw = raw.trim();

    if let Some(rest) = raw.strip_prefix('"') {
        return match rest.find('"') {
            Some(end) => (rest[..end].to_string(), rest[end + 1..].trim().to_string()),
            None => (rest.trim().to_string(), String::new()),
        };
    }

    // ASCII lowercasing keeps byte offsets valid for `raw`
    let lower = raw.to_ascii_lowercase();
    let mut search_from = 0;
    while let Some(found) = lower[search_from..].find(".exe") {
        let end = search_from + found + ".exe".len();
        let at_boundary = raw[end..].chars().next().map_or(true, char::is_whitespace);
        if at_boundary {
            return (raw[..end].to_string(), raw[end..].trim().to_string());
        }
        search_from = end;
    }

    match raw.split_once(char::is_whitespace) {
        Some((command, arguments)) => (command.to_string(), arguments.trim().to_string()),
        None => (raw.to_string(), String::new()),
    }
}

/// At most one candidate per entry: EXE quiet string, then EXE uninstall
/// string, then whichever one is an MSI invocation.
pub fn select_candidate(entry: &RegistryEntry) -> Option<UninstallCandidate> {
    let parsed: Vec<UninstallCandidate> = ["QuietUninstallString", "UninstallString"]
        .iter()
        .filter_map(|name| entry.text_value(name))
        .filter_map(parse_uninstall_string)
        .collect();

    parsed
        .iter()
        .find(|c| !c.is_msi())
        .or_else(|| parsed.iter().find(|c| c.is_msi()))
        .cloned()
}

/// Everything the uninstall script will try, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallPlan {
    /// Product codes found in uninstall-key paths.
    pub product_codes: Vec<String>,
    /// One candidate per uninstall entry, in entry order.
    pub candidates: Vec<UninstallCandidate>,
}

impl UninstallPlan {
    pub fn from_entries(entries: &[RegistryEntry]) -> Self {
        let mut product_codes = Vec::new();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for entry in entries.iter().filter(|e| is_uninstall_key(&e.full_path)) {
            push_unique(&mut product_codes, &mut seen, extract_product_codes(&entry.full_path));
            if let Some(candidate) = select_candidate(entry) {
                candidates.push(candidate);
            }
        }

        UninstallPlan {
            product_codes,
            candidates,
        }
    }

    /// Attempt order: path product codes, then MSI candidates whose code was
    /// not already tried, then EXE candidates.
    pub fn attempts(&self) -> Vec<UninstallCandidate> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut attempts = Vec::new();

        for code in &self.product_codes {
            tried.insert(code.clone());
            attempts.push(UninstallCandidate::Msi {
                product_code: code.clone(),
            });
        }
        for candidate in &self.candidates {
            if let UninstallCandidate::Msi { product_code } = candidate {
                if tried.insert(product_code.clone()) {
                    attempts.push(candidate.clone());
                }
            }
        }
        attempts.extend(self.candidates.iter().filter(|c| !c.is_msi()).cloned());
        attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::snapshot::RegistryValue;
    use std::collections::BTreeMap;

    const CODE: &str = "{AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE}";
    const UNINSTALL: &str = r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall";

    fn entry(path: &str, values: &[(&str, &str)]) -> RegistryEntry {
        let values: BTreeMap<String, RegistryValue> = values
            .iter()
            .map(|(k, v)| (k.to_string(), RegistryValue::from(*v)))
            .collect();
        RegistryEntry::new(path, values, 0)
    }

    fn contoso() -> RegistryEntry {
        entry(
            &format!(r"{}\{}", UNINSTALL, CODE),
            &[
                ("DisplayName", "Contoso App"),
                ("DisplayVersion", "3.2.0"),
                ("UninstallString", "MsiExec.exe /X{AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE}"),
            ],
        )
    }

    #[test]
    fn test_reference_identity_prefers_complete_entry() {
        let entries = vec![
            entry(r"HKLM\SOFTWARE\Contoso", &[("DisplayName", "Not an uninstall key")]),
            entry(&format!(r"{}\Helper", UNINSTALL), &[("DisplayName", "Contoso Helper")]),
            entry(
                &format!(r"{}\Main", UNINSTALL),
                &[("DisplayName", "Contoso App"), ("DisplayVersion", "3.2.0"), ("Publisher", "Contoso")],
            ),
        ];

        let identity = reference_identity(&entries).unwrap();
        assert_eq!(identity.name, "Contoso App");
        assert_eq!(identity.version.as_deref(), Some("3.2.0"));
        assert_eq!(identity.name_token(), "Contoso");
    }

    #[test]
    fn test_reference_identity_falls_back_to_first_named() {
        let identity = reference_identity(&[contoso()]).unwrap();
        assert_eq!(identity.name, "Contoso App");
        assert_eq!(identity.publisher, None);
    }

    #[test]
    fn test_reference_identity_requires_display_name() {
        let entries = vec![
            entry(&format!(r"{}\Blank", UNINSTALL), &[("DisplayName", "  ")]),
            entry(r"HKLM\SOFTWARE\Contoso", &[("DisplayName", "Contoso")]),
        ];
        assert_eq!(reference_identity(&entries), Err(GenerateError::NoApplicationFound));
    }

    #[test]
    fn test_extract_product_codes_uppercases() {
        let codes = extract_product_codes("MsiExec.exe /X{aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee} /qn");
        assert_eq!(codes, vec![CODE.to_string()]);
        assert!(extract_product_codes("{not-a-guid}").is_empty());
    }

    #[test]
    fn test_detection_product_codes_are_deduplicated() {
        let codes = detection_product_codes(&[contoso(), contoso()]);
        assert_eq!(codes, vec![CODE.to_string()]);
    }

    #[test]
    fn test_split_command_forms() {
        assert_eq!(
            split_command(r#""C:\Program Files\App\u.exe" /S /quiet"#),
            (r"C:\Program Files\App\u.exe".to_string(), "/S /quiet".to_string())
        );
        assert_eq!(
            split_command(r"C:\Program Files\App\unins000.exe /SILENT"),
            (r"C:\Program Files\App\unins000.exe".to_string(), "/SILENT".to_string())
        );
        assert_eq!(
            split_command(r"C:\Tools\app.exenope\u.exe"),
            (r"C:\Tools\app.exenope\u.exe".to_string(), String::new())
        );
        assert_eq!(
            split_command("rundll32 setupapi.dll,InstallHinfSection"),
            ("rundll32".to_string(), "setupapi.dll,InstallHinfSection".to_string())
        );
    }

    #[test]
    fn test_parse_uninstall_string_msi_without_code() {
        assert_eq!(parse_uninstall_string("msiexec /x"), None);
        assert_eq!(
            parse_uninstall_string("MsiExec.exe /I{AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE}"),
            Some(UninstallCandidate::Msi {
                product_code: CODE.to_string()
            })
        );
    }

    #[test]
    fn test_quiet_string_takes_precedence() {
        let app = entry(
            &format!(r"{}\App", UNINSTALL),
            &[
                ("DisplayName", "App"),
                ("QuietUninstallString", r"C:\App\u.exe /S /quiet"),
                ("UninstallString", r"C:\App\u.exe /S"),
            ],
        );

        let plan = UninstallPlan::from_entries(&[app]);
        let attempts = plan.attempts();
        assert_eq!(
            attempts.first(),
            Some(&UninstallCandidate::Exe {
                command: r"C:\App\u.exe".to_string(),
                arguments: "/S /quiet".to_string(),
            })
        );
        assert_eq!(attempts.len(), 1);
    }

    #[test]
    fn test_exe_string_beats_msi_string() {
        let app = entry(
            &format!(r"{}\App", UNINSTALL),
            &[
                ("QuietUninstallString", "MsiExec.exe /X{AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE} /qn"),
                ("UninstallString", r#""C:\App\setup.exe" --uninstall"#),
            ],
        );
        assert!(matches!(select_candidate(&app), Some(UninstallCandidate::Exe { .. })));
    }

    #[test]
    fn test_msi_path_code_is_the_only_attempt() {
        let plan = UninstallPlan::from_entries(&[contoso()]);

        assert_eq!(plan.product_codes, vec![CODE.to_string()]);
        assert_eq!(
            plan.attempts(),
            vec![UninstallCandidate::Msi {
                product_code: CODE.to_string()
            }]
        );
    }

    #[test]
    fn test_attempt_order() {
        let other = "{11111111-2222-3333-4444-555555555555}";
        let msi_string = format!("msiexec /x{}", other);
        let entries = vec![
            entry(&format!(r"{}\Exe", UNINSTALL), &[("UninstallString", r"C:\A\u.exe /S")]),
            entry(
                &format!(r"{}\Named", UNINSTALL),
                &[("UninstallString", msi_string.as_str())],
            ),
            contoso(),
        ];

        let attempts = UninstallPlan::from_entries(&entries).attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0], UninstallCandidate::Msi { product_code: CODE.to_string() });
        assert_eq!(attempts[1], UninstallCandidate::Msi { product_code: other.to_string() });
        assert!(!attempts[2].is_msi());
    }

    #[test]
    fn test_non_uninstall_keys_are_ignored() {
        let stray = entry(
            &format!(r"HKLM\SOFTWARE\Classes\Installer\Products\{}", CODE),
            &[("UninstallString", r"C:\A\u.exe")],
        );
        assert_eq!(UninstallPlan::from_entries(&[stray]), UninstallPlan::default());
    }

    #[test]
    fn test_vendor_uninstall_subkey_is_not_an_application() {
        let vendor = entry(
            r"HKLM\SOFTWARE\Contoso\Uninstall\Cache",
            &[
                ("DisplayName", "Cache Cleaner"),
                ("DisplayVersion", "1.0"),
                ("Publisher", "Contoso"),
                ("UninstallString", r"C:\Contoso\wipe-cache.exe"),
            ],
        );
        let entries = vec![vendor, contoso()];

        let identity = reference_identity(&entries).unwrap();
        assert_eq!(identity.name, "Contoso App");

        let attempts = UninstallPlan::from_entries(&entries).attempts();
        assert_eq!(
            attempts,
            vec![UninstallCandidate::Msi { product_code: CODE.to_string() }]
        );
    }
}
