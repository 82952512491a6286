//! Isolation profile generation for the sandbox wrapper

use crate::config::{Access, SandboxConfig};
use crate::error::ProcessError;
use std::path::{Path, PathBuf};

/// Network binding plus path whitelist for one launch
#[derive(Debug, Clone)]
pub struct IsolationProfile {
    interface: String,
    ip_address: String,
    rules: Vec<(PathBuf, Access)>,
}

impl IsolationProfile {
    /// Profile for a process confined to `workdir`
    pub fn for_workdir(config: &SandboxConfig, workdir: &Path) -> Self {
        let mut rules: Vec<(PathBuf, Access)> = config
            .paths
            .iter()
            .map(|rule| (rule.path.clone(), rule.access))
            .collect();
        rules.push((workdir.to_path_buf(), Access::ReadWrite));

        Self {
            interface: config.interface.clone(),
            ip_address: config.ip_address.clone(),
            rules,
        }
    }

    /// Render in the wrapper's profile syntax
    pub fn render(&self) -> String {
        let mut lines = Vec::with_capacity(self.rules.len() * 2 + 2);
        lines.push(format!("net {}", self.interface));
        lines.push(format!("ip {}", self.ip_address));

        for (path, access) in &self.rules {
            let path = path.display();
            match access {
                Access::ReadWrite => lines.push(format!("whitelist {path}")),
                Access::ReadOnly => lines.push(format!("read-only {path}")),
                Access::WhitelistReadOnly => {
                    lines.push(format!("whitelist {path}"));
                    lines.push(format!("read-only {path}"));
                }
            }
        }

        lines.join("\n")
    }

    /// Write the profile into the working directory, returning its path
    pub fn write(&self, workdir: &Path, file_name: &str) -> Result<PathBuf, ProcessError> {
        let path = workdir.join(file_name);
        std::fs::write(&path, self.render()).map_err(ProcessError::Profile)?;
        Ok(path)
    }
}

/// Wrap `command` with the sandbox launcher
pub fn wrap_command(config: &SandboxConfig, command: &[String]) -> Vec<String> {
    let mut wrapped = Vec::with_capacity(command.len() + 2);
    wrapped.push(config.wrapper.clone());
    wrapped.push(format!("--profile={}", config.profile_file));
    wrapped.extend(command.iter().cloned());
    wrapped
}
