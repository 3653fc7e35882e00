use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::fixscript::{FixOperation, parse_fix_script};

pub const DEFAULT_GROUP_PREFIX: &str = "gamefixes-";
pub const DEFAULT_ID_PREFIX: &str = "ulwgl-";

const FIX_EXTENSION: &str = "py";
const EXCLUDED_STEMS: [&str; 3] = ["default", "__init__", "winetricks-gui"];

#[derive(Debug, Clone, Serialize)]
pub struct FixScript {
    pub id: String,
    pub group: String,
    pub operations: Vec<FixOperation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixFile {
    pub id: String,
    pub path: PathBuf,
}

pub fn strip_id_prefix<'a>(value: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return value;
    }
    value.strip_prefix(prefix).unwrap_or(value)
}

/// Fix groups are the `gamefixes-<store>` directories at the top of the mirror.
pub fn list_fix_groups(fixes_dir: &Path, group_prefix: &str) -> Result<Vec<String>> {
    let mut groups = Vec::new();
    for entry in WalkDir::new(fixes_dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
    {
        let entry = entry.with_context(|| format!("failed to walk {}", fixes_dir.display()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with(group_prefix) {
            groups.push(name.into_owned());
        }
    }
    groups.sort();
    Ok(groups)
}

pub fn list_fix_files(group_dir: &Path, id_prefix: &str) -> Result<Vec<FixFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(group_dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
    {
        let entry = entry.with_context(|| format!("failed to walk {}", group_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(FIX_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            debug!(path = %path.display(), "skipping fix file with non UTF-8 name");
            continue;
        };
        if EXCLUDED_STEMS.contains(&stem) {
            continue;
        }
        files.push(FixFile {
            id: strip_id_prefix(stem, id_prefix).to_string(),
            path: path.to_path_buf(),
        });
    }
    files.sort_by(|left, right| left.id.cmp(&right.id));
    Ok(files)
}

pub fn list_fix_ids(group_dir: &Path, id_prefix: &str) -> Result<Vec<String>> {
    Ok(list_fix_files(group_dir, id_prefix)?
        .into_iter()
        .map(|file| file.id)
        .collect())
}

pub fn read_fix_script(file: &FixFile, group: &str) -> Result<FixScript> {
    let source = fs::read_to_string(&file.path)
        .with_context(|| format!("failed to read {}", file.path.display()))?;
    Ok(FixScript {
        id: file.id.clone(),
        group: group.to_string(),
        operations: parse_fix_script(&source),
    })
}

pub fn parse_fix_group(fixes_dir: &Path, group: &str, id_prefix: &str) -> Result<Vec<FixScript>> {
    let group_dir = fixes_dir.join(group);
    let files = list_fix_files(&group_dir, id_prefix)?;
    debug!(group, files = files.len(), "parsing fix group");
    files
        .iter()
        .map(|file| read_fix_script(file, group))
        .collect()
}

/// One id per line; surrounding whitespace and blank lines are ignored.
pub fn load_extra_ids(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn all_fix_ids(
    fixes_dir: &Path,
    group_prefix: &str,
    id_prefix: &str,
    extra_ids_path: Option<&Path>,
) -> Result<BTreeSet<String>> {
    let mut ids = BTreeSet::new();
    for group in list_fix_groups(fixes_dir, group_prefix)? {
        ids.extend(list_fix_ids(&fixes_dir.join(&group), id_prefix)?);
    }
    if let Some(path) = extra_ids_path {
        ids.extend(load_extra_ids(path)?);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{
        DEFAULT_GROUP_PREFIX, DEFAULT_ID_PREFIX, all_fix_ids, list_fix_groups, list_fix_ids,
        load_extra_ids, parse_fix_group, strip_id_prefix,
    };

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("create dir");
        fs::write(path, content).expect("write fixture");
    }

    fn fixture_mirror(root: &Path) {
        write(
            &root.join("gamefixes-steam/22380.py"),
            "def main():\n    util.protontricks('d3dx9')\n",
        );
        write(
            &root.join("gamefixes-steam/ulwgl-1091500.py"),
            "def main():\n    util.disable_esync()\n",
        );
        write(&root.join("gamefixes-steam/default.py"), "def main():\n    pass\n");
        write(&root.join("gamefixes-steam/__init__.py"), "");
        write(&root.join("gamefixes-steam/winetricks-gui.py"), "");
        write(&root.join("gamefixes-steam/README.md"), "docs");
        write(
            &root.join("gamefixes-gog/ulwgl-umu-gog-42.py"),
            "def main():\n    util.install_eac_runtime()\n",
        );
        write(&root.join("protonfixes/util.py"), "");
        write(&root.join("gamefixes-notes.txt"), "not a directory");
    }

    #[test]
    fn groups_are_prefixed_directories() {
        let temp = tempdir().expect("tempdir");
        fixture_mirror(temp.path());
        let groups = list_fix_groups(temp.path(), DEFAULT_GROUP_PREFIX).expect("groups");
        assert_eq!(groups, vec!["gamefixes-gog", "gamefixes-steam"]);
    }

    #[test]
    fn fix_ids_skip_excluded_stems_and_strip_prefix() {
        let temp = tempdir().expect("tempdir");
        fixture_mirror(temp.path());
        let ids = list_fix_ids(&temp.path().join("gamefixes-steam"), DEFAULT_ID_PREFIX)
            .expect("ids");
        assert_eq!(ids, vec!["1091500", "22380"]);
    }

    #[test]
    fn group_parse_keys_operations_by_id() {
        let temp = tempdir().expect("tempdir");
        fixture_mirror(temp.path());
        let scripts =
            parse_fix_group(temp.path(), "gamefixes-steam", DEFAULT_ID_PREFIX).expect("parse");
        assert_eq!(scripts.len(), 2);
        assert_eq!(scripts[0].id, "1091500");
        assert_eq!(scripts[0].group, "gamefixes-steam");
        assert_eq!(scripts[0].operations[0].to_string(), "disable_esync");
        assert_eq!(scripts[1].operations[0].to_string(), "protontricks: d3dx9");
    }

    #[test]
    fn all_fix_ids_include_extra_list() {
        let temp = tempdir().expect("tempdir");
        fixture_mirror(temp.path());
        let extra = temp.path().join("proton-steamids.txt");
        fs::write(&extra, "377160\n\n  22380 \n").expect("write ids");

        let ids = all_fix_ids(
            temp.path(),
            DEFAULT_GROUP_PREFIX,
            DEFAULT_ID_PREFIX,
            Some(&extra),
        )
        .expect("ids");
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        assert_eq!(ids, vec!["1091500", "22380", "377160", "umu-gog-42"]);
    }

    #[test]
    fn missing_extra_list_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let error = load_extra_ids(&temp.path().join("missing.txt")).expect_err("must fail");
        assert!(error.to_string().contains("failed to read"));
    }

    #[test]
    fn prefix_stripping_only_applies_at_start() {
        assert_eq!(strip_id_prefix("ulwgl-570", "ulwgl-"), "570");
        assert_eq!(strip_id_prefix("570", "ulwgl-"), "570");
        assert_eq!(strip_id_prefix("x-ulwgl-570", "ulwgl-"), "x-ulwgl-570");
        assert_eq!(strip_id_prefix("ulwgl-570", ""), "ulwgl-570");
    }
}
