//! Shared path utilities.
//!
//! Windows: %LOCALAPPDATA%/installscope/
//! Elsewhere the platform's local data directory as reported by `dirs`.

use std::path::PathBuf;

/// Get the installscope data directory.
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("installscope")
}

/// Default location of the pipeline configuration.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("config.json")
}

/// Where run artifacts go when no output directory is configured.
pub fn get_default_output_dir() -> PathBuf {
    get_data_dir().join("runs")
}

/// Expand `%VAR%` references. Unknown variables are left as written.
pub fn expand_env(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find('%') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('%') else { break };

        result.push_str(&rest[..start]);
        let name = &after[..end];
        match std::env::var(name) {
            Ok(expanded) if !name.is_empty() => {
                result.push_str(&expanded);
                rest = &after[end + 1..];
            }
            _ => {
                // Keep the first '%' and resume at the second, which may open a real variable
                result.push('%');
                result.push_str(name);
                rest = &after[end..];
            }
        }
    }
    result.push_str(rest);
    result
}
