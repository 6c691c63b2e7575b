use once_cell::sync::Lazy;
use regex::Regex;

static PROJECT_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._ -]*$").expect("project name pattern is valid")
});

/// Windows device names that cannot be used as file names.
const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Characters PowerShell treats as a single quote inside '...' strings.
const SINGLE_QUOTES: [char; 5] = ['\'', '\u{2018}', '\u{2019}', '\u{201A}', '\u{201B}'];

#[derive(Debug)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ValidationError {}

/// Validates a project name. It ends up in artifact file names such as
/// `Detect-<project>.ps1`, so it must be a safe Windows file name component.
pub fn validate_project_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError("Project name cannot be empty".to_string()));
    }
    if name.len() > 64 {
        return Err(ValidationError("Project name too long (max 64 characters)".to_string()));
    }
    if !PROJECT_NAME.is_match(name) {
        return Err(ValidationError(format!(
            "Invalid project name '{name}': use letters, digits, spaces, dots, dashes and underscores"
        )));
    }
    if name.ends_with('.') || name.ends_with(' ') {
        return Err(ValidationError(
            "Project name cannot end with a dot or a space".to_string(),
        ));
    }
    let stem = name.split('.').next().unwrap_or(name).trim();
    if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
        return Err(ValidationError(format!(
            "Project name '{name}' is a reserved Windows device name"
        )));
    }
    Ok(())
}

/// Escape a value for use inside a PowerShell single-quoted string.
///
/// Quote characters are doubled. Control characters are rejected: the value
/// also lands in script comments, where a line break would end the comment.
pub fn escape_for_powershell(value: &str) -> Result<String, ValidationError> {
    if let Some(c) = value.chars().find(|c| c.is_control()) {
        return Err(ValidationError(format!(
            "Value contains control character U+{:04X}",
            c as u32
        )));
    }

    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if SINGLE_QUOTES.contains(&c) {
            escaped.push(c);
        }
        escaped.push(c);
    }
    Ok(escaped)
}

/// Render a PowerShell single-quoted string literal.
pub fn powershell_literal(value: &str) -> Result<String, ValidationError> {
    Ok(format!("'{}'", escape_for_powershell(value)?))
}

/// Render a PowerShell array literal of single-quoted strings.
pub fn powershell_array(values: &[String]) -> Result<String, ValidationError> {
    if values.is_empty() {
        return Ok("@()".to_string());
    }
    let items = values
        .iter()
        .map(|v| powershell_literal(v))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!("@({})", items.join(", ")))
}
