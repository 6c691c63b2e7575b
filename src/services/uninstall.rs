use std::collections::HashMap;

use super::candidates::{reference_identity, GenerateError, UninstallCandidate, UninstallPlan};
use super::change_record::ChangeSet;
use super::snapshot::FileInfo;
use super::templates::{TemplateEngine, UNINSTALL_TEMPLATE};
use super::validation::{escape_for_powershell, powershell_array, powershell_literal};

pub const DEFAULT_PROGRAM_FILES_ROOTS: [&str; 2] = [r"C:\Program Files", r"C:\Program Files (x86)"];

fn normalize_dir(path: &str) -> String {
    path.trim().replace('/', "\\").trim_end_matches('\\').to_lowercase()
}

fn is_below(path: &str, ancestor: &str) -> bool {
    path.len() > ancestor.len() + 1
        && path.starts_with(ancestor)
        && path.as_bytes().get(ancestor.len()) == Some(&b'\\')
}

/// New directories below one of `roots`, excluding the roots themselves.
/// Nested directories are folded into their topmost new ancestor, since
/// removing that removes them too.
pub fn install_directories(files: &[FileInfo], roots: &[String]) -> Vec<String> {
    let roots: Vec<String> = roots.iter().map(|r| normalize_dir(r)).collect();

    let mut found: Vec<(String, String)> = Vec::new();
    for file in files.iter().filter(|f| f.is_directory) {
        let normalized = normalize_dir(&file.path);
        if !roots.iter().any(|root| is_below(&normalized, root)) {
            continue;
        }
        if found.iter().any(|(n, _)| *n == normalized) {
            continue;
        }
        let original = file.path.trim().replace('/', "\\");
        found.push((normalized, original.trim_end_matches('\\').to_string()));
    }

    found
        .iter()
        .filter(|(n, _)| !found.iter().any(|(other, _)| is_below(n, other)))
        .map(|(_, original)| original.clone())
        .collect()
}

fn render_attempt(attempt: &UninstallCandidate) -> Result<String, GenerateError> {
    Ok(match attempt {
        UninstallCandidate::Msi { product_code } => format!(
            "    @{{ Kind = 'MSI'; ProductCode = {} }}",
            powershell_literal(product_code)?
        ),
        UninstallCandidate::Exe { command, arguments } => format!(
            "    @{{ Kind = 'EXE'; Command = {}; Arguments = {} }}",
            powershell_literal(command)?,
            powershell_literal(arguments)?
        ),
    })
}

pub struct UninstallScriptGenerator {
    program_files_roots: Vec<String>,
}

impl Default for UninstallScriptGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM_FILES_ROOTS.iter().map(|r| r.to_string()).collect())
    }
}

impl UninstallScriptGenerator {
    pub fn new(program_files_roots: Vec<String>) -> Self {
        UninstallScriptGenerator { program_files_roots }
    }

    /// Render the best-effort uninstall script for a change set.
    pub fn generate(&self, change_set: &ChangeSet) -> Result<String, GenerateError> {
        let identity = reference_identity(&change_set.new_registry_keys)?;
        let attempts = UninstallPlan::from_entries(&change_set.new_registry_keys).attempts();
        let directories = install_directories(&change_set.new_files, &self.program_files_roots);

        let rendered_attempts: Vec<String> = attempts
            .iter()
            .filter_map(|attempt| match render_attempt(attempt) {
                Ok(line) => Some(line),
                Err(e) => {
                    log::warn!("Skipping uninstall attempt {:?}: {}", attempt, e);
                    None
                }
            })
            .collect();
        let mut attempts_block = rendered_attempts.join(",\n");
        if !attempts_block.is_empty() {
            attempts_block.push('\n');
        }

        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("app_name", escape_for_powershell(&identity.name)?);
        vars.insert("project_name", escape_for_powershell(change_set.project_name())?);
        vars.insert("timestamp", escape_for_powershell(change_set.timestamp())?);
        vars.insert("attempts", attempts_block);
        vars.insert("install_directories", powershell_array(&directories)?);

        if rendered_attempts.is_empty() {
            log::warn!("No uninstall method found for '{}'; script will only clean up", identity.name);
        }
        log::info!(
            "Generated uninstall script for '{}' ({} attempts, {} directories)",
            identity.name,
            rendered_attempts.len(),
            directories.len()
        );
        Ok(TemplateEngine::render(UNINSTALL_TEMPLATE, &vars))
    }
}
