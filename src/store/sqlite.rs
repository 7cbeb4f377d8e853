use super::{
    CatalogCounts, Favorite, StoreBackend, StoreError, StoreHandle, StoredTitle, WatchProgress,
};
use crate::models::{CatalogSnapshot, ContentKind, Episode, MergeStats, Movie, Series, Source};
use camino::{Utf8Path, Utf8PathBuf};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::fs;

/// Files SQLite may leave next to a database.
const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// SQLite backend: `<data_dir>/<storage_file_name>` per source, seeded from
/// `<seed_dir>/<storage_file_name>` on first open.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    data_dir: Utf8PathBuf,
    seed_dir: Utf8PathBuf,
}

impl SqliteBackend {
    pub fn new<P: AsRef<Utf8Path>, Q: AsRef<Utf8Path>>(
        data_dir: P,
        seed_dir: Q,
    ) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir)?;
        }
        Ok(Self {
            data_dir,
            seed_dir: seed_dir.as_ref().to_path_buf(),
        })
    }

    pub fn db_path(&self, source: &Source) -> Utf8PathBuf {
        self.data_dir.join(source.storage_file_name)
    }

    pub fn seed_path(&self, source: &Source) -> Utf8PathBuf {
        self.seed_dir.join(source.storage_file_name)
    }

    /// Make sure a database file exists for `source`, copying the seed if there is one.
    fn materialize(&self, source: &Source) -> Result<Utf8PathBuf, StoreError> {
        let db_path = self.db_path(source);
        if db_path.exists() {
            return Ok(db_path);
        }

        let seed_path = self.seed_path(source);
        if seed_path.exists() {
            fs::copy(&seed_path, &db_path)?;
            tracing::info!("Created store for {} from seed {}", source.id, seed_path);
        } else if source.supports_network_sync() {
            tracing::info!(
                "No seed for {} at {}, starting with an empty store",
                source.id,
                seed_path
            );
        } else {
            return Err(StoreError::SeedMissing {
                source_id: source.id.to_string(),
                path: seed_path,
            });
        }
        Ok(db_path)
    }
}

impl StoreBackend for SqliteBackend {
    fn open(&self, source: &'static Source) -> Result<Box<dyn StoreHandle>, StoreError> {
        let db_path = self.materialize(source)?;
        let conn = Connection::open(&db_path)?;
        init_schema(&conn)?;
        Ok(Box::new(SqliteStore {
            source_id: source.id,
            conn,
        }))
    }

    fn delete(&self, source: &Source) -> Result<(), StoreError> {
        let db_path = self.db_path(source);
        if db_path.exists() {
            fs::remove_file(&db_path)?;
        }
        for suffix in SIDECAR_SUFFIXES {
            let sidecar = Utf8PathBuf::from(format!("{}{}", db_path, suffix));
            if sidecar.exists() {
                fs::remove_file(&sidecar)?;
            }
        }
        Ok(())
    }

    fn exists(&self, source: &Source) -> bool {
        self.db_path(source).exists()
    }
}

/// Column names follow the content database shipped with the original seeds,
/// so bundled seed files open without migration.
fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cached_movies (
            id INTEGER PRIMARY KEY NOT NULL,
            title TEXT NOT NULL,
            posterUrl TEXT,
            farsilandUrl TEXT NOT NULL UNIQUE,
            description TEXT,
            year INTEGER,
            rating REAL,
            runtime INTEGER,
            director TEXT,
            cast TEXT,
            genres TEXT,
            dateAdded INTEGER NOT NULL,
            lastUpdated INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS index_cached_movies_dateAdded ON cached_movies(dateAdded);

        CREATE TABLE IF NOT EXISTS cached_series (
            id INTEGER PRIMARY KEY NOT NULL,
            title TEXT NOT NULL,
            posterUrl TEXT,
            backdropUrl TEXT,
            farsilandUrl TEXT NOT NULL UNIQUE,
            description TEXT,
            year INTEGER,
            rating REAL,
            totalSeasons INTEGER NOT NULL DEFAULT 0,
            totalEpisodes INTEGER NOT NULL DEFAULT 0,
            cast TEXT,
            genres TEXT,
            dateAdded INTEGER NOT NULL,
            lastUpdated INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS index_cached_series_dateAdded ON cached_series(dateAdded);

        CREATE TABLE IF NOT EXISTS cached_episodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            seriesId INTEGER NOT NULL,
            seriesTitle TEXT,
            episodeId INTEGER NOT NULL DEFAULT 0,
            season INTEGER NOT NULL,
            episode INTEGER NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            thumbnailUrl TEXT,
            farsilandUrl TEXT NOT NULL UNIQUE,
            airDate TEXT,
            runtime INTEGER,
            dateAdded INTEGER NOT NULL,
            lastUpdated INTEGER NOT NULL,
            UNIQUE(seriesId, season, episode)
        );
        CREATE INDEX IF NOT EXISTS index_cached_episodes_dateAdded ON cached_episodes(dateAdded);

        CREATE TABLE IF NOT EXISTS cached_genres (
            id INTEGER PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            slug TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS favorites (
            contentKind TEXT NOT NULL,
            contentId INTEGER NOT NULL,
            addedAt INTEGER NOT NULL,
            PRIMARY KEY (contentKind, contentId)
        );

        CREATE TABLE IF NOT EXISTS watch_progress (
            contentKind TEXT NOT NULL,
            contentId INTEGER NOT NULL,
            positionMs INTEGER NOT NULL,
            durationMs INTEGER NOT NULL,
            updatedAt INTEGER NOT NULL,
            PRIMARY KEY (contentKind, contentId)
        );",
    )?;
    Ok(())
}

fn table_for(kind: ContentKind) -> &'static str {
    match kind {
        ContentKind::Movie => "cached_movies",
        ContentKind::Series => "cached_series",
        ContentKind::Episode => "cached_episodes",
    }
}

fn join_genres(genres: &[String]) -> Option<String> {
    if genres.is_empty() {
        None
    } else {
        Some(genres.join(","))
    }
}

/// Open SQLite store for one source.
pub struct SqliteStore {
    source_id: &'static str,
    conn: Connection,
}

impl SqliteStore {
    fn lookup_id(&self, kind: ContentKind, url: &str) -> Result<Option<i64>, StoreError> {
        let sql = format!("SELECT id FROM {} WHERE farsilandUrl = ?1", table_for(kind));
        Ok(self
            .conn
            .query_row(&sql, params![url], |row| row.get(0))
            .optional()?)
    }

    fn count(&self, table: &str) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        let n: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

/// Returns `true` when a new row was inserted.
fn upsert_movie(tx: &Transaction<'_>, movie: &Movie, now_ms: i64) -> rusqlite::Result<bool> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM cached_movies WHERE farsilandUrl = ?1",
            params![movie.url],
            |row| row.get(0),
        )
        .optional()?;
    let genres = join_genres(&movie.genres);
    let last_updated = movie.last_updated.unwrap_or(now_ms);

    match existing {
        Some(id) => {
            tx.execute(
                "UPDATE cached_movies
                 SET title = ?1, posterUrl = ?2, description = ?3, year = ?4, rating = ?5,
                     runtime = ?6, director = ?7, cast = ?8, genres = ?9, lastUpdated = ?10
                 WHERE id = ?11",
                params![
                    movie.title,
                    movie.poster_url,
                    movie.description,
                    movie.year,
                    movie.rating,
                    movie.runtime,
                    movie.director,
                    movie.cast,
                    genres,
                    last_updated,
                    id,
                ],
            )?;
            Ok(false)
        }
        None => {
            tx.execute(
                "INSERT INTO cached_movies
                 (title, posterUrl, farsilandUrl, description, year, rating, runtime,
                  director, cast, genres, dateAdded, lastUpdated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    movie.title,
                    movie.poster_url,
                    movie.url,
                    movie.description,
                    movie.year,
                    movie.rating,
                    movie.runtime,
                    movie.director,
                    movie.cast,
                    genres,
                    movie.date_added.unwrap_or(now_ms),
                    last_updated,
                ],
            )?;
            Ok(true)
        }
    }
}

fn upsert_series(tx: &Transaction<'_>, series: &Series, now_ms: i64) -> rusqlite::Result<bool> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM cached_series WHERE farsilandUrl = ?1",
            params![series.url],
            |row| row.get(0),
        )
        .optional()?;
    let genres = join_genres(&series.genres);
    let last_updated = series.last_updated.unwrap_or(now_ms);

    match existing {
        Some(id) => {
            tx.execute(
                "UPDATE cached_series
                 SET title = ?1, posterUrl = ?2, backdropUrl = ?3, description = ?4, year = ?5,
                     rating = ?6, totalSeasons = ?7, totalEpisodes = ?8, cast = ?9, genres = ?10,
                     lastUpdated = ?11
                 WHERE id = ?12",
                params![
                    series.title,
                    series.poster_url,
                    series.backdrop_url,
                    series.description,
                    series.year,
                    series.rating,
                    series.total_seasons,
                    series.total_episodes,
                    series.cast,
                    genres,
                    last_updated,
                    id,
                ],
            )?;
            Ok(false)
        }
        None => {
            tx.execute(
                "INSERT INTO cached_series
                 (title, posterUrl, backdropUrl, farsilandUrl, description, year, rating,
                  totalSeasons, totalEpisodes, cast, genres, dateAdded, lastUpdated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    series.title,
                    series.poster_url,
                    series.backdrop_url,
                    series.url,
                    series.description,
                    series.year,
                    series.rating,
                    series.total_seasons,
                    series.total_episodes,
                    series.cast,
                    genres,
                    series.date_added.unwrap_or(now_ms),
                    last_updated,
                ],
            )?;
            Ok(true)
        }
    }
}

/// Move whatever row other than `keep` sits at `(series_id, season, number)` to a
/// placeholder position. Placeholders are `-id`, which no real episode uses.
fn park_slot_holder(
    tx: &Transaction<'_>,
    keep: i64,
    series_id: i64,
    season: i32,
    number: i32,
    parked: &mut Vec<i64>,
) -> rusqlite::Result<()> {
    let holder: Option<i64> = tx
        .query_row(
            "SELECT id FROM cached_episodes
             WHERE seriesId = ?1 AND season = ?2 AND episode = ?3 AND id != ?4",
            params![series_id, season, number, keep],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = holder {
        tx.execute(
            "UPDATE cached_episodes SET episode = -id WHERE id = ?1",
            params![id],
        )?;
        parked.push(id);
    }
    Ok(())
}

/// Parked rows that no later episode in the snapshot moved back onto a real position.
fn count_displaced(tx: &Transaction<'_>, parked: &[i64]) -> rusqlite::Result<usize> {
    let mut displaced = 0;
    for &id in parked {
        let still_parked: bool = tx.query_row(
            "SELECT episode = -id FROM cached_episodes WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if still_parked {
            displaced += 1;
        }
    }
    Ok(displaced)
}

/// `None` when the episode's series is unknown locally and the episode was skipped.
fn upsert_episode(
    tx: &Transaction<'_>,
    episode: &Episode,
    now_ms: i64,
    parked: &mut Vec<i64>,
) -> rusqlite::Result<Option<bool>> {
    let series_id: Option<i64> = tx
        .query_row(
            "SELECT id FROM cached_series WHERE farsilandUrl = ?1",
            params![episode.series_url],
            |row| row.get(0),
        )
        .optional()?;
    let Some(series_id) = series_id else {
        return Ok(None);
    };

    // Upstream occasionally re-keys an episode; fall back to its position in the series.
    let existing: Option<i64> = match tx
        .query_row(
            "SELECT id FROM cached_episodes WHERE farsilandUrl = ?1",
            params![episode.url],
            |row| row.get(0),
        )
        .optional()?
    {
        Some(id) => Some(id),
        None => tx
            .query_row(
                "SELECT id FROM cached_episodes
                 WHERE seriesId = ?1 AND season = ?2 AND episode = ?3",
                params![series_id, episode.season, episode.episode],
                |row| row.get(0),
            )
            .optional()?,
    };
    let last_updated = episode.last_updated.unwrap_or(now_ms);

    match existing {
        Some(id) => {
            // Renumbered upstream: the target position may still hold another row.
            park_slot_holder(tx, id, series_id, episode.season, episode.episode, parked)?;
            tx.execute(
                "UPDATE cached_episodes
                 SET seriesId = ?1, seriesTitle = ?2, season = ?3, episode = ?4, title = ?5,
                     description = ?6, thumbnailUrl = ?7, farsilandUrl = ?8, airDate = ?9,
                     runtime = ?10, lastUpdated = ?11
                 WHERE id = ?12",
                params![
                    series_id,
                    episode.series_title,
                    episode.season,
                    episode.episode,
                    episode.title,
                    episode.description,
                    episode.thumbnail_url,
                    episode.url,
                    episode.air_date,
                    episode.runtime,
                    last_updated,
                    id,
                ],
            )?;
            Ok(Some(false))
        }
        None => {
            tx.execute(
                "INSERT INTO cached_episodes
                 (seriesId, seriesTitle, season, episode, title, description, thumbnailUrl,
                  farsilandUrl, airDate, runtime, dateAdded, lastUpdated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    series_id,
                    episode.series_title,
                    episode.season,
                    episode.episode,
                    episode.title,
                    episode.description,
                    episode.thumbnail_url,
                    episode.url,
                    episode.air_date,
                    episode.runtime,
                    episode.date_added.unwrap_or(now_ms),
                    last_updated,
                ],
            )?;
            Ok(Some(true))
        }
    }
}

impl StoreHandle for SqliteStore {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    fn probe(&self) -> Result<u64, StoreError> {
        self.count("cached_movies")
    }

    fn merge(&mut self, snapshot: &CatalogSnapshot, now_ms: i64) -> Result<MergeStats, StoreError> {
        let tx = self.conn.transaction()?;
        let mut stats = MergeStats::default();

        for movie in &snapshot.movies {
            if upsert_movie(&tx, movie, now_ms)? {
                stats.movies_inserted += 1;
            } else {
                stats.movies_updated += 1;
            }
        }

        // Series go before episodes so new episodes can resolve their series.
        for series in &snapshot.series {
            if upsert_series(&tx, series, now_ms)? {
                stats.series_inserted += 1;
            } else {
                stats.series_updated += 1;
            }
        }

        let mut parked = Vec::new();
        for episode in &snapshot.episodes {
            match upsert_episode(&tx, episode, now_ms, &mut parked)? {
                Some(true) => stats.episodes_inserted += 1,
                Some(false) => stats.episodes_updated += 1,
                None => {
                    tracing::debug!(
                        "Skipping episode {} of {}: series {} is unknown",
                        episode.url,
                        self.source_id,
                        episode.series_url
                    );
                    stats.episodes_skipped += 1;
                }
            }
        }
        if stats.episodes_skipped > 0 {
            tracing::warn!(
                "Skipped {} episodes of {} whose series is unknown",
                stats.episodes_skipped,
                self.source_id
            );
        }
        parked.sort_unstable();
        parked.dedup();
        let displaced = count_displaced(&tx, &parked)?;
        if displaced > 0 {
            tracing::warn!(
                "{} episodes of {} lost their position to renumbered upstream episodes",
                displaced,
                self.source_id
            );
        }

        for genre in &snapshot.genres {
            let updated = tx.execute(
                "UPDATE cached_genres SET name = ?1 WHERE slug = ?2",
                params![genre.name, genre.slug],
            )?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO cached_genres (name, slug) VALUES (?1, ?2)",
                    params![genre.name, genre.slug],
                )?;
            }
            stats.genres_upserted += 1;
        }

        tx.commit()?;

        tracing::debug!("Merged into {}: {}", self.source_id, stats.summary());
        Ok(stats)
    }

    fn counts(&self) -> Result<CatalogCounts, StoreError> {
        Ok(CatalogCounts {
            movies: self.count("cached_movies")?,
            series: self.count("cached_series")?,
            episodes: self.count("cached_episodes")?,
            genres: self.count("cached_genres")?,
            favorites: self.count("favorites")?,
        })
    }

    fn find_title(&self, kind: ContentKind, url: &str) -> Result<Option<StoredTitle>, StoreError> {
        let sql = format!(
            "SELECT id, farsilandUrl, title, dateAdded, lastUpdated FROM {} WHERE farsilandUrl = ?1",
            table_for(kind)
        );
        Ok(self
            .conn
            .query_row(&sql, params![url], |row| {
                Ok(StoredTitle {
                    id: row.get(0)?,
                    url: row.get(1)?,
                    title: row.get(2)?,
                    date_added: row.get(3)?,
                    last_updated: row.get(4)?,
                })
            })
            .optional()?)
    }

    fn latest_titles(&self, limit: usize) -> Result<Vec<StoredTitle>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, farsilandUrl, title, dateAdded, lastUpdated FROM cached_movies
             UNION ALL
             SELECT id, farsilandUrl, title, dateAdded, lastUpdated FROM cached_series
             ORDER BY 4 DESC
             LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            Ok(StoredTitle {
                id: row.get(0)?,
                url: row.get(1)?,
                title: row.get(2)?,
                date_added: row.get(3)?,
                last_updated: row.get(4)?,
            })
        })?;

        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn add_favorite(&mut self, kind: ContentKind, url: &str, now_ms: i64) -> Result<bool, StoreError> {
        let Some(id) = self.lookup_id(kind, url)? else {
            return Ok(false);
        };
        self.conn.execute(
            "INSERT OR IGNORE INTO favorites (contentKind, contentId, addedAt) VALUES (?1, ?2, ?3)",
            params![kind.as_str(), id, now_ms],
        )?;
        Ok(true)
    }

    fn favorites(&self) -> Result<Vec<Favorite>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT contentKind, contentId, addedAt FROM favorites ORDER BY addedAt DESC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut favorites = Vec::new();
        for row in rows {
            let (kind, content_id, added_at) = row?;
            match ContentKind::parse(&kind) {
                Some(kind) => favorites.push(Favorite {
                    kind,
                    content_id,
                    added_at,
                }),
                None => tracing::debug!("Ignoring favorite with unknown kind {}", kind),
            }
        }
        Ok(favorites)
    }

    fn save_progress(
        &mut self,
        kind: ContentKind,
        url: &str,
        position_ms: i64,
        duration_ms: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let Some(id) = self.lookup_id(kind, url)? else {
            return Ok(false);
        };
        self.conn.execute(
            "INSERT INTO watch_progress (contentKind, contentId, positionMs, durationMs, updatedAt)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(contentKind, contentId)
             DO UPDATE SET positionMs = excluded.positionMs,
                           durationMs = excluded.durationMs,
                           updatedAt = excluded.updatedAt",
            params![kind.as_str(), id, position_ms, duration_ms, now_ms],
        )?;
        Ok(true)
    }

    fn progress(&self, kind: ContentKind, url: &str) -> Result<Option<WatchProgress>, StoreError> {
        let Some(id) = self.lookup_id(kind, url)? else {
            return Ok(None);
        };
        Ok(self
            .conn
            .query_row(
                "SELECT positionMs, durationMs, updatedAt FROM watch_progress
                 WHERE contentKind = ?1 AND contentId = ?2",
                params![kind.as_str(), id],
                |row| {
                    Ok(WatchProgress {
                        position_ms: row.get(0)?,
                        duration_ms: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        let source_id = self.source_id;
        self.conn.close().map_err(|(_conn, e)| StoreError::CloseFailed {
            source_id: source_id.to_string(),
            message: e.to_string(),
        })
    }
}
