use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::CatalogEntry;
use crate::config::{DEFAULT_LIBRARY_PROVIDER, FixtoolConfig};
use crate::fixes::{DEFAULT_ID_PREFIX, strip_id_prefix};
use crate::providers::{LibraryGame, ProviderGame, ProviderIndex};

/// Providers never emitted as association rows besides the library provider.
const IGNORED_PROVIDERS: [&str; 1] = ["igdb"];

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub id_prefix: String,
    pub library_provider: String,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            id_prefix: DEFAULT_ID_PREFIX.to_string(),
            library_provider: DEFAULT_LIBRARY_PROVIDER.to_string(),
        }
    }
}

impl ReconcileOptions {
    pub fn from_config(config: &FixtoolConfig) -> Self {
        Self {
            id_prefix: config.id_prefix().to_string(),
            library_provider: config.library_provider().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogMiss {
    pub title: String,
    pub library_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssociationRow {
    pub name: String,
    pub provider: String,
    pub slug: String,
    pub catalog_id: String,
}

impl AssociationRow {
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},,",
            self.name, self.provider, self.slug, self.catalog_id
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Catalog titles whose library id has no fix script.
    pub without_fixes: Vec<CatalogMiss>,
    pub non_library: Vec<CatalogMiss>,
    pub missing_library_records: Vec<CatalogMiss>,
    /// Provider records reached from catalog entries.
    pub catalog_associations: Vec<ProviderGame>,
    pub unmatched_fix_rows: Vec<AssociationRow>,
    pub fixes_not_found: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryMatch {
    pub name: String,
    pub providers: Vec<String>,
}

impl LibraryMatch {
    pub fn provider_list(&self) -> String {
        self.providers.join(", ")
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LibraryMatchReport {
    pub matches: Vec<LibraryMatch>,
    pub unmatched: BTreeSet<String>,
}

pub fn reconcile(
    catalog: &BTreeMap<String, Vec<CatalogEntry>>,
    fix_ids: &BTreeSet<String>,
    index: &dyn ProviderIndex,
    options: &ReconcileOptions,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let mut seen = BTreeSet::new();

    for entries in catalog.values() {
        for entry in entries {
            let library_id = strip_id_prefix(&entry.catalog_id, &options.id_prefix);
            let miss = || CatalogMiss {
                title: entry.title.clone(),
                library_id: library_id.to_string(),
            };

            if fix_ids.contains(library_id) {
                seen.insert(library_id.to_string());
            } else {
                warn!(title = %entry.title, id = library_id, "catalog entry has no fixes");
                report.without_fixes.push(miss());
            }

            let is_numeric =
                !library_id.is_empty() && library_id.chars().all(|ch| ch.is_ascii_digit());
            if !is_numeric || entry.code_name.as_deref() == Some(library_id) {
                info!(title = %entry.title, id = library_id, "non library game in catalog");
                report.non_library.push(miss());
                continue;
            }

            match index.find_provider_game(&options.library_provider, library_id)? {
                Some(provider_game) => {
                    let rows = resolve_associations(index, &provider_game, options, "in catalog")?;
                    report
                        .catalog_associations
                        .extend(rows.into_iter().map(|(record, _)| record));
                }
                None => {
                    warn!(
                        provider = %options.library_provider,
                        id = library_id,
                        "library record not found"
                    );
                    report.missing_library_records.push(miss());
                }
            }
            break;
        }
    }

    for fix_id in fix_ids.difference(&seen) {
        let Some(provider_game) = index.find_provider_game(&options.library_provider, fix_id)?
        else {
            report.fixes_not_found.insert(fix_id.clone());
            continue;
        };
        for (record, library_record) in
            resolve_associations(index, &provider_game, options, "fix not in catalog")?
        {
            report.unmatched_fix_rows.push(AssociationRow {
                name: record.name,
                provider: record.provider,
                slug: record.slug,
                catalog_id: format!("{}{}", options.id_prefix, library_record.slug),
            });
        }
    }

    if !report.fixes_not_found.is_empty() {
        warn!(
            count = report.fixes_not_found.len(),
            ids = ?report.fixes_not_found,
            "fix ids without a library record"
        );
    }
    Ok(report)
}

/// Pairs each foreign provider record of the first associated library game
/// with the library provider record it was reached from.
pub fn resolve_associations(
    index: &dyn ProviderIndex,
    provider_game: &ProviderGame,
    options: &ReconcileOptions,
    context: &str,
) -> Result<Vec<(ProviderGame, ProviderGame)>> {
    let library_games = index.library_games_for(provider_game)?;
    let Some(first) = first_library_game(provider_game, &library_games) else {
        return Ok(Vec::new());
    };

    let mut rows = Vec::new();
    for record in index.provider_games_for(first)? {
        if record.provider == options.library_provider
            || IGNORED_PROVIDERS.contains(&record.provider.as_str())
        {
            continue;
        }
        info!(context, %record, "associated provider game");
        rows.push((record, provider_game.clone()));
    }
    Ok(rows)
}

fn first_library_game<'a>(
    provider_game: &ProviderGame,
    library_games: &'a [LibraryGame],
) -> Option<&'a LibraryGame> {
    match library_games {
        [] => {
            warn!(%provider_game, "no associated library game");
            None
        }
        [only] => Some(only),
        [first, ..] => {
            warn!(%provider_game, count = library_games.len(), "more than one library game");
            for game in library_games {
                warn!(%game, "associated library game");
            }
            Some(first)
        }
    }
}

/// For each id, the library game reached through the library provider record
/// and every provider pair of that game.
pub fn match_library_games(
    index: &dyn ProviderIndex,
    ids: &[String],
    library_provider: &str,
) -> Result<LibraryMatchReport> {
    let mut report = LibraryMatchReport::default();
    for id in ids {
        let Some(provider_game) = index.find_provider_game(library_provider, id)? else {
            report.unmatched.insert(id.clone());
            continue;
        };
        let library_games = index.library_games_for(&provider_game)?;
        if library_games.is_empty() {
            report.unmatched.insert(id.clone());
            continue;
        }
        for game in library_games {
            let providers = index
                .provider_games_for(&game)?
                .into_iter()
                .map(|record| format!("{}:{}", record.provider, record.slug))
                .collect();
            report.matches.push(LibraryMatch {
                name: game.name,
                providers,
            });
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use anyhow::Result;

    use super::{ReconcileOptions, match_library_games, reconcile};
    use crate::catalog::{CatalogEntry, group_by_catalog_id};
    use crate::providers::{
        LibraryGame, ProviderGame, ProviderIndex, RecordSet, SqliteProviderIndex,
    };

    #[derive(Default)]
    struct MockIndex {
        provider_games: Vec<ProviderGame>,
        library_games: Vec<LibraryGame>,
        links: Vec<(i64, i64)>,
    }

    impl MockIndex {
        fn provider(&mut self, provider: &str, slug: &str, name: &str) -> i64 {
            let id = self.provider_games.len() as i64 + 1;
            self.provider_games.push(ProviderGame {
                id,
                provider: provider.to_string(),
                slug: slug.to_string(),
                name: name.to_string(),
            });
            id
        }

        fn game(&mut self, name: &str, providers: &[i64]) -> i64 {
            let id = self.library_games.len() as i64 + 1;
            self.library_games.push(LibraryGame {
                id,
                name: name.to_string(),
                slug: name.to_lowercase().replace(' ', "-"),
            });
            for provider_id in providers {
                self.links.push((id, *provider_id));
            }
            id
        }
    }

    impl ProviderIndex for MockIndex {
        fn find_provider_game(&self, provider: &str, slug: &str) -> Result<Option<ProviderGame>> {
            Ok(self
                .provider_games
                .iter()
                .find(|game| game.provider == provider && game.slug == slug)
                .cloned())
        }

        fn library_games_for(&self, provider_game: &ProviderGame) -> Result<Vec<LibraryGame>> {
            Ok(self
                .library_games
                .iter()
                .filter(|game| self.links.contains(&(game.id, provider_game.id)))
                .cloned()
                .collect())
        }

        fn provider_games_for(&self, library_game: &LibraryGame) -> Result<Vec<ProviderGame>> {
            Ok(self
                .provider_games
                .iter()
                .filter(|game| self.links.contains(&(library_game.id, game.id)))
                .cloned()
                .collect())
        }
    }

    fn entry(catalog_id: &str, title: &str, code_name: &str) -> CatalogEntry {
        CatalogEntry {
            catalog_id: catalog_id.to_string(),
            title: title.to_string(),
            code_name: Some(code_name.to_string()),
            store: None,
        }
    }

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn fix_outside_catalog_produces_association_rows() {
        let mut index = MockIndex::default();
        let steam = index.provider("steam", "22380", "Fallout: New Vegas");
        let gog = index.provider("gog", "fallout_new_vegas", "Fallout New Vegas");
        let igdb = index.provider("igdb", "fallout-new-vegas", "Fallout: New Vegas");
        index.game("Fallout New Vegas", &[steam, gog, igdb]);

        let report = reconcile(
            &BTreeMap::new(),
            &ids(&["22380"]),
            &index,
            &ReconcileOptions::default(),
        )
        .expect("reconcile");

        assert_eq!(report.unmatched_fix_rows.len(), 1);
        assert_eq!(
            report.unmatched_fix_rows[0].to_csv_line(),
            "Fallout New Vegas,gog,fallout_new_vegas,ulwgl-22380,,"
        );
        assert!(report.fixes_not_found.is_empty());
    }

    #[test]
    fn unknown_fix_ids_are_collected() {
        let index = MockIndex::default();
        let report = reconcile(
            &BTreeMap::new(),
            &ids(&["1", "2"]),
            &index,
            &ReconcileOptions::default(),
        )
        .expect("reconcile");
        assert_eq!(report.fixes_not_found, ids(&["1", "2"]));
        assert!(report.unmatched_fix_rows.is_empty());
    }

    #[test]
    fn catalog_entries_mark_fixes_as_seen() {
        let mut index = MockIndex::default();
        let steam = index.provider("steam", "316720", "Grim Fandango Remastered");
        let gog = index.provider("gog", "1207658918", "Grim Fandango Remastered");
        index.game("Grim Fandango Remastered", &[steam, gog]);

        let catalog = group_by_catalog_id(vec![
            entry("ulwgl-316720", "Grim Fandango Remastered", "316720x"),
            entry("ulwgl-999", "No Fix Game", "999x"),
        ]);
        let report = reconcile(
            &catalog,
            &ids(&["316720"]),
            &index,
            &ReconcileOptions::default(),
        )
        .expect("reconcile");

        assert!(report.unmatched_fix_rows.is_empty());
        assert!(report.fixes_not_found.is_empty());
        assert_eq!(report.catalog_associations.len(), 1);
        assert_eq!(report.catalog_associations[0].provider, "gog");
        assert_eq!(report.without_fixes.len(), 1);
        assert_eq!(report.without_fixes[0].library_id, "999");
        assert_eq!(report.missing_library_records.len(), 1);
    }

    #[test]
    fn non_library_entry_lets_next_entry_try() {
        let mut index = MockIndex::default();
        index.provider("steam", "570", "Dota 2");

        let catalog = group_by_catalog_id(vec![
            entry("ulwgl-570", "Dota 2", "570"),
            entry("ulwgl-570", "Dota 2 (alt)", "dota"),
        ]);
        let report = reconcile(
            &catalog,
            &ids(&["570"]),
            &index,
            &ReconcileOptions::default(),
        )
        .expect("reconcile");

        assert_eq!(report.non_library.len(), 1);
        assert_eq!(report.non_library[0].title, "Dota 2");
        assert!(report.missing_library_records.is_empty());
        assert!(report.fixes_not_found.is_empty());
    }

    #[test]
    fn non_numeric_catalog_ids_are_not_looked_up() {
        let index = MockIndex::default();
        let catalog = group_by_catalog_id(vec![entry("ulwgl-egs-hydrangea", "Hydrangea", "x")]);
        let report = reconcile(
            &catalog,
            &ids(&["egs-hydrangea"]),
            &index,
            &ReconcileOptions::default(),
        )
        .expect("reconcile");
        assert_eq!(report.non_library.len(), 1);
        assert!(report.without_fixes.is_empty());
        assert!(report.missing_library_records.is_empty());
        assert!(report.fixes_not_found.is_empty());
    }

    #[test]
    fn duplicate_library_games_use_first() {
        let mut index = MockIndex::default();
        let steam = index.provider("steam", "10", "Counter-Strike");
        let gog = index.provider("gog", "cs", "Counter-Strike");
        let humble = index.provider("humblestore", "cs-humble", "Counter-Strike Humble");
        index.game("Counter-Strike", &[steam, gog]);
        index.game("Counter-Strike Duplicate", &[steam, humble]);

        let report = reconcile(
            &BTreeMap::new(),
            &ids(&["10"]),
            &index,
            &ReconcileOptions::default(),
        )
        .expect("reconcile");
        let lines: Vec<String> = report
            .unmatched_fix_rows
            .iter()
            .map(|row| row.to_csv_line())
            .collect();
        assert_eq!(lines, vec!["Counter-Strike,gog,cs,ulwgl-10,,"]);
    }

    #[test]
    fn library_matches_over_sqlite_records() {
        let records: RecordSet = serde_json::from_str(
            r#"{"games": [
                {"name": "Half-Life", "slug": "half-life", "providers": [
                    {"provider": "steam", "slug": "70"},
                    {"provider": "gog", "slug": "half_life"}
                ]}
            ]}"#,
        )
        .expect("records");
        let mut index = SqliteProviderIndex::open_in_memory().expect("open");
        index.import_records(&records).expect("import");

        let report = match_library_games(
            &index,
            &["70".to_string(), "220".to_string()],
            "steam",
        )
        .expect("matches");
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].name, "Half-Life");
        assert_eq!(report.matches[0].provider_list(), "steam:70, gog:half_life");
        assert_eq!(report.unmatched, ids(&["220"]));
    }
}
