use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::render_default_config;

pub const STATE_DIR_NAME: &str = ".fixtool";
pub const FIXES_DIR_NAME: &str = "protonfixes";
pub const EXTRA_IDS_FILENAME: &str = "proton-steamids.txt";
pub const PROVIDER_DB_FILENAME: &str = "providers.db";
const CONFIG_FILENAME: &str = "config.toml";

const ROOT_ENV: &str = "FIXTOOL_PROJECT_ROOT";
const DATA_DIR_ENV: &str = "FIXTOOL_DATA_DIR";
const FIXES_DIR_ENV: &str = "FIXTOOL_FIXES_DIR";
const CONFIG_ENV: &str = "FIXTOOL_CONFIG";

/// Where a resolved path came from, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub fixes_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        Ok(Self {
            cwd: env::current_dir().context("failed to read current directory")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub fixes_dir: PathBuf,
    pub extra_ids_path: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub fixes_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        let entries: [(&str, &Path, Option<ValueSource>); 7] = [
            ("project_root", self.project_root.as_path(), Some(self.root_source)),
            ("state_dir", self.state_dir.as_path(), None),
            ("data_dir", self.data_dir.as_path(), Some(self.data_source)),
            ("fixes_dir", self.fixes_dir.as_path(), Some(self.fixes_source)),
            ("extra_ids_path", self.extra_ids_path.as_path(), None),
            ("db_path", self.db_path.as_path(), None),
            ("config_path", self.config_path.as_path(), Some(self.config_source)),
        ];
        entries
            .iter()
            .map(|(label, path, source)| match source {
                Some(source) => format!(
                    "{label}={} ({})",
                    normalize_for_display(path),
                    source.as_str()
                ),
                None => format!("{label}={}", normalize_for_display(path)),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub state_dir_exists: bool,
    pub fixes_dir_exists: bool,
    pub extra_ids_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let db_size_bytes = match fs::metadata(&paths.db_path) {
        Ok(metadata) => Some(metadata.len()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to inspect {}", paths.db_path.display()));
        }
    };
    let status = RuntimeStatus {
        state_dir_exists: paths.state_dir.is_dir(),
        fixes_dir_exists: paths.fixes_dir.is_dir(),
        extra_ids_exists: paths.extra_ids_path.is_file(),
        db_exists: db_size_bytes.is_some(),
        db_size_bytes,
        config_exists: paths.config_path.is_file(),
        warnings: Vec::new(),
    };

    let warnings = [
        (
            status.fixes_dir_exists,
            "fix mirror is missing; run `fixtool sync` first".to_string(),
        ),
        (
            status.extra_ids_exists,
            format!("{EXTRA_IDS_FILENAME} is missing; reconciliation uses fix files only"),
        ),
        (
            status.db_exists,
            "provider database is missing; run `fixtool db import <file>`".to_string(),
        ),
    ]
    .into_iter()
    .filter(|(present, _)| !present)
    .map(|(_, warning)| warning)
    .collect();

    Ok(RuntimeStatus { warnings, ..status })
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

/// Create the state and data directories and materialize the default config.
/// An existing config is only replaced with `force`.
pub fn init_layout(paths: &ResolvedPaths, force: bool) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.state_dir, &paths.data_dir] {
        if dir.is_dir() {
            continue;
        }
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        created_dirs.push(dir.clone());
    }

    let wrote_config = if paths.config_path.exists() && !force {
        false
    } else {
        if let Some(parent) = paths.config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&paths.config_path, render_default_config())
            .with_context(|| format!("failed to write {}", paths.config_path.display()))?;
        true
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    if context.cwd.as_os_str().is_empty() {
        anyhow::bail!("failed to resolve project root: empty working directory");
    }

    // The project root anchors every relative override below.
    let (project_root, root_source) = explicit_path(
        overrides.project_root.as_deref(),
        lookup_env(ROOT_ENV),
        &context.cwd,
    )
    .unwrap_or_else(|| (find_project_root(&context.cwd), ValueSource::Heuristic));
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = explicit_path(
        overrides.data_dir.as_deref(),
        lookup_env(DATA_DIR_ENV),
        &project_root,
    )
    .unwrap_or_else(|| (state_dir.join("data"), ValueSource::Default));
    let (fixes_dir, fixes_source) = explicit_path(
        overrides.fixes_dir.as_deref(),
        lookup_env(FIXES_DIR_ENV),
        &project_root,
    )
    .unwrap_or_else(|| (data_dir.join(FIXES_DIR_NAME), ValueSource::Default));
    let (config_path, config_source) = explicit_path(
        overrides.config.as_deref(),
        lookup_env(CONFIG_ENV),
        &project_root,
    )
    .unwrap_or_else(|| (state_dir.join(CONFIG_FILENAME), ValueSource::Default));

    Ok(ResolvedPaths {
        extra_ids_path: data_dir.join(EXTRA_IDS_FILENAME),
        db_path: data_dir.join(PROVIDER_DB_FILENAME),
        project_root,
        state_dir,
        data_dir,
        fixes_dir,
        config_path,
        root_source,
        data_source,
        fixes_source,
        config_source,
    })
}

/// A flag wins over a non-blank environment value; relative values are
/// joined onto `base`.
fn explicit_path(
    flag: Option<&Path>,
    env_value: Option<String>,
    base: &Path,
) -> Option<(PathBuf, ValueSource)> {
    if let Some(path) = flag {
        return Some((base.join(path), ValueSource::Flag));
    }
    let value = env_value?;
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    Some((base.join(value), ValueSource::Env))
}

/// Nearest ancestor of `cwd` holding a state directory, else `cwd` itself.
fn find_project_root(cwd: &Path) -> PathBuf {
    cwd.ancestors()
        .find(|dir| dir.join(STATE_DIR_NAME).is_dir())
        .unwrap_or(cwd)
        .to_path_buf()
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
