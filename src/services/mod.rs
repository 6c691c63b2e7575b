pub mod candidates;
pub mod change_record;
pub mod collector;
pub mod config;
pub mod detection;
pub mod differ;
pub mod logs;
pub mod orchestrator;
pub mod paths;
pub mod registry;
pub mod retry;
pub mod snapshot;
pub mod templates;
pub mod uninstall;
pub mod validation;
pub mod version;

use std::process::Command;

/// Creates a Command that runs without a visible console window on Windows.
pub fn hidden_command(program: impl AsRef<std::ffi::OsStr>) -> Command {
    let mut cmd = Command::new(program);
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}
