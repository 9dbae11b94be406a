//! One-shot installation of the plugin requirements file.

use std::path::PathBuf;
use std::process::Command;

use once_cell::sync::OnceCell;
use tracing::{error, info};

use crate::config::PluginSettings;

/// Result of running the plugin file installer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { file: PathBuf },
    Skipped { reason: String },
    Failed { message: String },
}

impl InstallOutcome {
    pub fn is_installed(&self) -> bool {
        matches!(self, InstallOutcome::Installed { .. })
    }
}

static INSTALL_RESULT: OnceCell<InstallOutcome> = OnceCell::new();

/// Install the plugin file with the configured command, at most once per
/// process. Later calls return the first outcome regardless of `settings`.
pub fn install_plugin_file(settings: &PluginSettings) -> InstallOutcome {
    INSTALL_RESULT.get_or_init(|| run_install(settings)).clone()
}

/// Run the installer unconditionally.
pub fn run_install(settings: &PluginSettings) -> InstallOutcome {
    let Some((program, args)) = settings.install_command.split_first() else {
        return InstallOutcome::Skipped {
            reason: "no install command configured".into(),
        };
    };

    let file = settings.plugin_file_path();
    if !file.exists() {
        return InstallOutcome::Skipped {
            reason: format!("plugin file {} not found", file.display()),
        };
    }

    info!(file = %file.display(), command = %program, "Installing plugin file");

    match Command::new(program).args(args).arg(&file).output() {
        Ok(output) if output.status.success() => {
            info!(file = %file.display(), "Plugin file installed");
            InstallOutcome::Installed { file }
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("installer exited with {}", output.status)
            } else {
                stderr
            };
            error!(file = %file.display(), error = %message, "Plugin file install failed");
            InstallOutcome::Failed { message }
        }
        Err(e) => {
            error!(command = %program, error = %e, "Cannot run plugin installer");
            InstallOutcome::Failed {
                message: format!("cannot run '{}': {}", program, e),
            }
        }
    }
}
