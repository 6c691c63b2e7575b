use std::collections::HashMap;

pub struct TemplateEngine;

impl TemplateEngine {
    /// Replace `{{variable}}` placeholders with values.
    ///
    /// Single pass: substituted text is never scanned again, so a value that
    /// happens to contain `{{...}}` stays as it is. Unknown placeholders are
    /// left untouched.
    pub fn render(template: &str, vars: &HashMap<&str, String>) -> String {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else { break };

            result.push_str(&rest[..start]);
            let key = after[..end].trim();
            match vars.get(key) {
                Some(value) => result.push_str(value),
                None => result.push_str(&rest[start..start + 2 + end + 2]),
            }
            rest = &after[end + 2..];
        }
        result.push_str(rest);
        result
    }
}

/// Detection script. Exit 0 when the application is present and new enough,
/// 1 otherwise.
pub const DETECTION_TEMPLATE: &str = r#"# Detection script for {{app_name}}
# Generated by installscope from change set '{{project_name}}' ({{timestamp}})

$ErrorActionPreference = 'SilentlyContinue'

$AppName = '{{app_name}}'
$NameToken = '{{name_token}}'
$RequiredVersion = '{{required_version}}'
$ProductCodes = {{product_codes}}
$UninstallRoots = @(
    'HKLM:\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall',
    'HKLM:\SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall',
    'HKCU:\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall'
)

function Test-NameMatch {
    param([string]$DisplayName)
    if ([string]::IsNullOrWhiteSpace($DisplayName)) { return $false }
    if ($DisplayName.Trim() -eq $AppName) { return $true }
    return $DisplayName.IndexOf($NameToken, [StringComparison]::OrdinalIgnoreCase) -ge 0
}

function Compare-DottedVersion {
    param([string]$Installed, [string]$Required)
    try {
        $have = @($Installed.Trim().Split('.') | ForEach-Object {
            if ($_ -notmatch '^\s*\d+\s*$') { throw "not numeric" }
            [uint64]$_.Trim()
        })
        $want = @($Required.Trim().Split('.') | ForEach-Object {
            if ($_ -notmatch '^\s*\d+\s*$') { throw "not numeric" }
            [uint64]$_.Trim()
        })
    } catch {
        # Unparseable versions count as satisfied
        return $true
    }
    $length = [Math]::Max($have.Count, $want.Count)
    for ($i = 0; $i -lt $length; $i++) {
        $h = if ($i -lt $have.Count) { $have[$i] } else { 0 }
        $w = if ($i -lt $want.Count) { $want[$i] } else { 0 }
        if ($h -gt $w) { return $true }
        if ($h -lt $w) { return $false }
    }
    return $true
}

$found = $false
$installedVersion = $null

foreach ($code in $ProductCodes) {
    foreach ($root in $UninstallRoots) {
        $entry = Get-ItemProperty -Path (Join-Path $root $code) -ErrorAction SilentlyContinue
        if ($entry -and (Test-NameMatch $entry.DisplayName)) {
            $found = $true
            $installedVersion = $entry.DisplayVersion
            break
        }
    }
    if ($found) { break }
}

if (-not $found) {
    foreach ($root in $UninstallRoots) {
        $entries = Get-ChildItem -Path $root -ErrorAction SilentlyContinue |
            Get-ItemProperty -ErrorAction SilentlyContinue
        foreach ($entry in $entries) {
            if (Test-NameMatch $entry.DisplayName) {
                $found = $true
                $installedVersion = $entry.DisplayVersion
                break
            }
        }
        if ($found) { break }
    }
}

if (-not $found) {
    Write-Output "$AppName not detected"
    exit 1
}

if ($RequiredVersion -and $installedVersion) {
    if (-not (Compare-DottedVersion -Installed $installedVersion -Required $RequiredVersion)) {
        Write-Output "$AppName $installedVersion is older than required $RequiredVersion"
        exit 1
    }
}

Write-Output "$AppName detected (version $installedVersion)"
exit 0
"#;

/// Best-effort uninstall script. Always exits 0; the outcome is in the log.
pub const UNINSTALL_TEMPLATE: &str = r#"# Uninstall script for {{app_name}}
# Generated by installscope from change set '{{project_name}}' ({{timestamp}})

$AppName = '{{app_name}}'
$LogPath = Join-Path $env:ProgramData 'installscope\Uninstall-{{project_name}}.log'
New-Item -ItemType Directory -Path (Split-Path $LogPath) -Force -ErrorAction SilentlyContinue | Out-Null

function Write-Log {
    param([string]$Message, [string]$Level = 'INFO')
    $line = "{0} [{1}] {2}" -f (Get-Date -Format 'yyyy-MM-dd HH:mm:ss'), $Level, $Message
    Write-Host $line
    Add-Content -Path $LogPath -Value $line -ErrorAction SilentlyContinue
}

function Test-UninstallExitCode {
    param([int]$Code)
    # 3010: success, reboot required
    return ($Code -eq 0) -or ($Code -eq 3010)
}

function Invoke-MsiUninstall {
    param([string]$ProductCode)
    Write-Log "Uninstalling MSI product $ProductCode"
    try {
        $process = Start-Process -FilePath 'msiexec.exe' -ArgumentList "/x $ProductCode /quiet /norestart" -Wait -PassThru -NoNewWindow
        Write-Log "msiexec exited with code $($process.ExitCode)"
        return (Test-UninstallExitCode $process.ExitCode)
    } catch {
        Write-Log "msiexec failed: $($_.Exception.Message)" 'WARN'
        return $false
    }
}

function Invoke-ExeUninstall {
    param([string]$Command, [string]$Arguments)
    if ([System.IO.Path]::IsPathRooted($Command) -and -not (Test-Path -LiteralPath $Command)) {
        Write-Log "Uninstaller not found: $Command" 'WARN'
        return $false
    }
    Write-Log "Running $Command $Arguments"
    try {
        if ($Arguments) {
            $process = Start-Process -FilePath $Command -ArgumentList $Arguments -Wait -PassThru -NoNewWindow
        } else {
            $process = Start-Process -FilePath $Command -Wait -PassThru -NoNewWindow
        }
        Write-Log "$Command exited with code $($process.ExitCode)"
        return (Test-UninstallExitCode $process.ExitCode)
    } catch {
        Write-Log "$Command failed: $($_.Exception.Message)" 'WARN'
        return $false
    }
}

$Attempts = @(
{{attempts}})

$InstallDirectories = {{install_directories}}

Write-Log "Starting uninstall of $AppName"
$uninstallSuccess = $false

foreach ($attempt in $Attempts) {
    if ($attempt.Kind -eq 'MSI') {
        $ok = Invoke-MsiUninstall -ProductCode $attempt.ProductCode
    } else {
        $ok = Invoke-ExeUninstall -Command $attempt.Command -Arguments $attempt.Arguments
    }
    if ($ok) {
        $uninstallSuccess = $true
        break
    }
}

foreach ($dir in $InstallDirectories) {
    if (Test-Path -LiteralPath $dir) {
        try {
            Remove-Item -LiteralPath $dir -Recurse -Force -ErrorAction Stop
            Write-Log "Removed $dir"
        } catch {
            Write-Log "Failed to remove ${dir}: $($_.Exception.Message)" 'WARN'
        }
    } else {
        Write-Log "Directory not found, skipping: $dir"
    }
}

Write-Log "uninstallSuccess: $uninstallSuccess"
if (-not $uninstallSuccess) {
    Write-Log "No uninstall method succeeded for $AppName; verify removal manually" 'WARN'
}
exit 0
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_replaces_all_occurrences() {
        let mut vars = HashMap::new();
        vars.insert("name", "Contoso".to_string());
        let result = TemplateEngine::render("{{name}} and {{ name }}", &vars);
        assert_eq!(result, "Contoso and Contoso");
    }

    #[test]
    fn test_render_keeps_unknown_placeholders() {
        let vars = HashMap::new();
        assert_eq!(TemplateEngine::render("a {{missing}} b", &vars), "a {{missing}} b");
        assert_eq!(TemplateEngine::render("open {{ only", &vars), "open {{ only");
        assert_eq!(TemplateEngine::render("", &vars), "");
    }

    #[test]
    fn test_render_does_not_rescan_values() {
        let mut vars = HashMap::new();
        vars.insert("a", "{{b}}".to_string());
        vars.insert("b", "oops".to_string());
        assert_eq!(TemplateEngine::render("{{a}}", &vars), "{{b}}");
    }

    #[test]
    fn test_templates_have_expected_placeholders() {
        for key in ["app_name", "name_token", "required_version", "product_codes"] {
            assert!(DETECTION_TEMPLATE.contains(&format!("{{{{{}}}}}", key)), "{}", key);
        }
        for key in ["app_name", "attempts", "install_directories"] {
            assert!(UNINSTALL_TEMPLATE.contains(&format!("{{{{{}}}}}", key)), "{}", key);
        }
    }
}
