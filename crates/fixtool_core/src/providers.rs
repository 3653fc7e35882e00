use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

const PROVIDER_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS library_games (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    slug TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS provider_games (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider TEXT NOT NULL,
    slug TEXT NOT NULL,
    name TEXT NOT NULL,
    UNIQUE (provider, slug)
);
CREATE INDEX IF NOT EXISTS idx_provider_games_slug ON provider_games(slug);

CREATE TABLE IF NOT EXISTS library_game_providers (
    library_game_id INTEGER NOT NULL,
    provider_game_id INTEGER NOT NULL,
    PRIMARY KEY (library_game_id, provider_game_id),
    FOREIGN KEY (library_game_id) REFERENCES library_games(id) ON DELETE CASCADE,
    FOREIGN KEY (provider_game_id) REFERENCES provider_games(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_library_game_providers_provider
    ON library_game_providers(provider_game_id);
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderGame {
    pub id: i64,
    pub provider: String,
    pub slug: String,
    pub name: String,
}

impl fmt::Display for ProviderGame {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} ({}:{})", self.name, self.provider, self.slug)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryGame {
    pub id: i64,
    pub name: String,
    pub slug: String,
}

impl fmt::Display for LibraryGame {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} ({})", self.name, self.slug)
    }
}

/// Lookups the reconciliation needs from the provider record store.
pub trait ProviderIndex {
    fn find_provider_game(&self, provider: &str, slug: &str) -> Result<Option<ProviderGame>>;
    /// Library games associated with a provider record, oldest first.
    fn library_games_for(&self, provider_game: &ProviderGame) -> Result<Vec<LibraryGame>>;
    fn provider_games_for(&self, library_game: &LibraryGame) -> Result<Vec<ProviderGame>>;
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecordSet {
    #[serde(default)]
    pub games: Vec<LibraryRecord>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LibraryRecord {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub providers: Vec<ProviderRecord>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderRecord {
    pub provider: String,
    pub slug: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub library_games: usize,
    pub provider_games: usize,
    pub new_associations: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    pub library_games: usize,
    pub provider_games: usize,
    pub associations: usize,
}

pub fn load_record_file(path: &Path) -> Result<RecordSet> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to decode provider records {}", path.display()))
}

pub struct SqliteProviderIndex {
    connection: Connection,
}

impl SqliteProviderIndex {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create database parent directory {}",
                    parent.display()
                )
            })?;
        }
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        Self::with_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::with_connection(connection)
    }

    fn with_connection(connection: Connection) -> Result<Self> {
        connection
            .pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign_keys pragma")?;
        connection
            .execute_batch(PROVIDER_SCHEMA_SQL)
            .context("failed to initialize provider schema")?;
        Ok(Self { connection })
    }

    /// Upserts every game and provider record, then links them. Existing
    /// associations are kept.
    pub fn import_records(&mut self, records: &RecordSet) -> Result<ImportReport> {
        let transaction = self
            .connection
            .transaction()
            .context("failed to start provider import transaction")?;
        let mut report = ImportReport::default();
        {
            let mut upsert_game = transaction
                .prepare(
                    "INSERT INTO library_games (name, slug) VALUES (?1, ?2)
                     ON CONFLICT(slug) DO UPDATE SET name = excluded.name
                     RETURNING id",
                )
                .context("failed to prepare library_games upsert")?;
            let mut upsert_provider = transaction
                .prepare(
                    "INSERT INTO provider_games (provider, slug, name) VALUES (?1, ?2, ?3)
                     ON CONFLICT(provider, slug) DO UPDATE SET name = excluded.name
                     RETURNING id",
                )
                .context("failed to prepare provider_games upsert")?;
            let mut link = transaction
                .prepare(
                    "INSERT OR IGNORE INTO library_game_providers
                        (library_game_id, provider_game_id)
                     VALUES (?1, ?2)",
                )
                .context("failed to prepare association insert")?;

            for game in &records.games {
                let game_id: i64 = upsert_game
                    .query_row(params![game.name, game.slug], |row| row.get(0))
                    .with_context(|| format!("failed to store library game {}", game.slug))?;
                report.library_games += 1;

                for provider in &game.providers {
                    let name = provider.name.as_deref().unwrap_or(&game.name);
                    let provider_id: i64 = upsert_provider
                        .query_row(params![provider.provider, provider.slug, name], |row| {
                            row.get(0)
                        })
                        .with_context(|| {
                            format!(
                                "failed to store provider game {}:{}",
                                provider.provider, provider.slug
                            )
                        })?;
                    report.provider_games += 1;
                    report.new_associations += link
                        .execute(params![game_id, provider_id])
                        .context("failed to link provider game")?;
                }
            }
        }
        transaction
            .commit()
            .context("failed to commit provider import transaction")?;
        debug!(?report, "imported provider records");
        Ok(report)
    }

    pub fn stats(&self) -> Result<ProviderStats> {
        Ok(ProviderStats {
            library_games: self.count_rows("library_games")?,
            provider_games: self.count_rows("provider_games")?,
            associations: self.count_rows("library_game_providers")?,
        })
    }

    fn count_rows(&self, table: &str) -> Result<usize> {
        let count: i64 = self
            .connection
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
            .with_context(|| format!("failed to count {table}"))?;
        usize::try_from(count).with_context(|| format!("negative row count in {table}"))
    }
}

impl ProviderIndex for SqliteProviderIndex {
    fn find_provider_game(&self, provider: &str, slug: &str) -> Result<Option<ProviderGame>> {
        self.connection
            .query_row(
                "SELECT id, provider, slug, name FROM provider_games
                 WHERE provider = ?1 AND slug = ?2",
                params![provider, slug],
                provider_game_from_row,
            )
            .optional()
            .with_context(|| format!("failed to look up provider game {provider}:{slug}"))
    }

    fn library_games_for(&self, provider_game: &ProviderGame) -> Result<Vec<LibraryGame>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT g.id, g.name, g.slug
                 FROM library_games g
                 JOIN library_game_providers l ON l.library_game_id = g.id
                 WHERE l.provider_game_id = ?1
                 ORDER BY g.id ASC",
            )
            .context("failed to prepare library games query")?;
        let rows = statement
            .query_map([provider_game.id], |row| {
                Ok(LibraryGame {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    slug: row.get(2)?,
                })
            })
            .context("failed to run library games query")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode library game row")?);
        }
        Ok(out)
    }

    fn provider_games_for(&self, library_game: &LibraryGame) -> Result<Vec<ProviderGame>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT p.id, p.provider, p.slug, p.name
                 FROM provider_games p
                 JOIN library_game_providers l ON l.provider_game_id = p.id
                 WHERE l.library_game_id = ?1
                 ORDER BY p.id ASC",
            )
            .context("failed to prepare provider games query")?;
        let rows = statement
            .query_map([library_game.id], provider_game_from_row)
            .context("failed to run provider games query")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode provider game row")?);
        }
        Ok(out)
    }
}

fn provider_game_from_row(row: &Row<'_>) -> rusqlite::Result<ProviderGame> {
    Ok(ProviderGame {
        id: row.get(0)?,
        provider: row.get(1)?,
        slug: row.get(2)?,
        name: row.get(3)?,
    })
}
