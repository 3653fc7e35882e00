use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;

const GIT_BINARY: &str = "git";
const REMOTE_NAME: &str = "origin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryAction {
    Cloned,
    Pulled,
}

impl RepositoryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cloned => "cloned",
            Self::Pulled => "pulled",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepositoryReport {
    pub action: RepositoryAction,
    pub stdout: String,
}

/// Pull the mirror when it exists, otherwise clone it from `url`.
pub fn update_repository(url: &str, path: &Path) -> Result<RepositoryReport> {
    if path.exists() {
        info!(path = %path.display(), "pulling fix repository");
        let stdout = run_git(&["pull", REMOTE_NAME], Some(path))?;
        return Ok(RepositoryReport {
            action: RepositoryAction::Pulled,
            stdout,
        });
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    info!(url, path = %path.display(), "cloning fix repository");
    let target = path.to_string_lossy();
    let stdout = run_git(&["clone", url, target.as_ref()], None)?;
    Ok(RepositoryReport {
        action: RepositoryAction::Cloned,
        stdout,
    })
}

fn run_git(args: &[&str], working_dir: Option<&Path>) -> Result<String> {
    let mut command = Command::new(GIT_BINARY);
    if let Some(dir) = working_dir {
        command.arg("-C").arg(dir);
    }
    command.args(args);

    let output = command
        .output()
        .with_context(|| format!("failed to execute {GIT_BINARY} {}", args.join(" ")))?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        bail!(
            "{GIT_BINARY} {} failed ({}): {stderr}",
            args.join(" "),
            output.status
        );
    }
    Ok(stdout)
}
