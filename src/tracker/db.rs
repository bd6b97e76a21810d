//! Database writer trait for overlap results
//!
//! Audience member lists never reach the database; only derived counts,
//! channel metadata, stream info and iteration markers do.

use super::error::DbError;
use super::types::{Channel, ChannelMetadata, OverlapEntry, TopChannel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Timestamp format of the `iterations` table
pub const MARKER_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// SQLite waits this long on a locked database before reporting busy
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Trait for writing overlap results to SQLite
///
/// Tables written (see `/sql/` directory):
/// - `overlap_<channel>` - one per channel, created on demand
/// - `users` - INSERT OR IGNORE on channel_name
/// - `streams` - one row per channel per iteration
/// - `iterations` - one marker per completed pass
#[async_trait]
pub trait OverlapDbWriter: Send + Sync {
    /// Create `overlap_<channel>` if missing
    async fn ensure_channel_table(&self, channel: &Channel) -> Result<(), DbError>;

    /// Write one channel's overlap rows for `iteration`
    ///
    /// Operation: INSERT OR REPLACE on (iteration, channel_name), in one
    /// transaction. Writing the same iteration twice leaves one row per pair.
    async fn write_overlap_rows(
        &self,
        channel: &Channel,
        iteration: u64,
        rows: &[OverlapEntry],
    ) -> Result<(), DbError>;

    /// Register newly seen channels in `users`
    async fn write_channel_metadata(&self, entries: &[ChannelMetadata]) -> Result<(), DbError>;

    /// Record the tracked channel set for `iteration` in `streams`
    async fn write_stream_info(&self, iteration: u64, entries: &[TopChannel])
        -> Result<(), DbError>;

    /// Record that `iteration` completed at `timestamp`
    async fn write_iteration_marker(
        &self,
        iteration: u64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), DbError>;

    /// Channels already present in `users`
    async fn load_known_channels(&self) -> Result<Vec<Channel>, DbError>;
}

/// Run schema migrations from SQL files
///
/// Reads every `.sql` file in `schema_dir` in file name order and executes
/// it. All SQL files must use "IF NOT EXISTS" clauses so reruns are no-ops.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), DbError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(DbError::Schema(format!(
            "Schema directory not found: {}",
            schema_dir
        )));
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        log::info!("   ├─ Executing: {}", filename);

        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)
            .map_err(|e| DbError::Schema(format!("{}: {}", filename, e)))?;

        log::info!("   └─ ✅ Success: {}", filename);
    }

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

fn table_name(channel: &Channel) -> String {
    // Channel is restricted to [a-z0-9_], safe inside a quoted identifier
    format!("\"overlap_{}\"", channel)
}

/// SQLite implementation of OverlapDbWriter
pub struct SqliteOverlapWriter {
    conn: Arc<Mutex<Connection>>,
    created_tables: Mutex<HashSet<Channel>>,
}

impl SqliteOverlapWriter {
    /// Open the database and apply the schema in `schema_dir`
    pub fn open_with_schema(db_path: &str, schema_dir: &str) -> Result<Self, DbError> {
        let mut conn = Connection::open(db_path)?;
        run_schema_migrations(&mut conn, schema_dir)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            created_tables: Mutex::new(HashSet::new()),
        })
    }

    fn create_table(&self, conn: &Connection, channel: &Channel) -> Result<(), DbError> {
        let mut created = self.created_tables.lock().unwrap();
        if created.contains(channel) {
            return Ok(());
        }

        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                iteration       INTEGER NOT NULL,
                channel_name    TEXT NOT NULL,
                overlap_count   INTEGER NOT NULL,
                total_chatters  INTEGER,
                UNIQUE(iteration, channel_name)
            );
            "#,
            table_name(channel)
        ))?;

        created.insert(channel.clone());
        log::debug!("Added table overlap_{} to database", channel);
        Ok(())
    }
}

#[async_trait]
impl OverlapDbWriter for SqliteOverlapWriter {
    async fn ensure_channel_table(&self, channel: &Channel) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        self.create_table(&conn, channel)
    }

    async fn write_overlap_rows(
        &self,
        channel: &Channel,
        iteration: u64,
        rows: &[OverlapEntry],
    ) -> Result<(), DbError> {
        let mut conn = self.conn.lock().unwrap();
        self.create_table(&conn, channel)?;

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO {} (iteration, channel_name, overlap_count, total_chatters)
                 VALUES (?, ?, ?, ?)",
                table_name(channel)
            ))?;

            for row in rows {
                stmt.execute(params![
                    iteration as i64,
                    row.other_channel.as_str(),
                    row.overlap_count as i64,
                    row.total_chatters_of_channel as i64,
                ])?;
            }
        }
        tx.commit()?;

        Ok(())
    }

    async fn write_channel_metadata(&self, entries: &[ChannelMetadata]) -> Result<(), DbError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO users (channel_name, channel_id, description, creation_date)
                 VALUES (?, ?, ?, ?)",
            )?;

            for entry in entries {
                stmt.execute(params![
                    entry.channel.as_str(),
                    entry.channel_id,
                    entry.description,
                    entry.creation_date.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;

        log::debug!("Stored metadata for {} channels", entries.len());
        Ok(())
    }

    async fn write_stream_info(
        &self,
        iteration: u64,
        entries: &[TopChannel],
    ) -> Result<(), DbError> {
        let now = Utc::now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR REPLACE INTO streams (
                    iteration, channel_name, category_name, category_id,
                    title, viewer_count, uptime, language
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )?;

            for entry in entries {
                stmt.execute(params![
                    iteration as i64,
                    entry.channel.as_str(),
                    entry.category,
                    entry.category_id,
                    entry.title,
                    entry.viewer_count as i64,
                    entry.uptime_secs(now),
                    entry.language,
                ])?;
            }
        }
        tx.commit()?;

        Ok(())
    }

    async fn write_iteration_marker(
        &self,
        iteration: u64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO iterations (iteration, timestamp) VALUES (?, ?)",
            params![
                iteration as i64,
                timestamp.format(MARKER_TIMESTAMP_FORMAT).to_string()
            ],
        )?;

        Ok(())
    }

    async fn load_known_channels(&self) -> Result<Vec<Channel>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT channel_name FROM users ORDER BY channel_name")?;

        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut channels = Vec::with_capacity(names.len());
        for name in names {
            match Channel::parse(&name) {
                Ok(channel) => channels.push(channel),
                Err(e) => log::warn!("⚠️  Ignoring stored user: {}", e),
            }
        }

        Ok(channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    const SCHEMA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/sql");

    /// Helper to create a test database with the repository schema
    fn create_test_db() -> (NamedTempFile, SqliteOverlapWriter) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();

        let writer = SqliteOverlapWriter::open_with_schema(db_path, SCHEMA_DIR).unwrap();
        (temp_file, writer)
    }

    fn ch(name: &str) -> Channel {
        Channel::parse(name).unwrap()
    }

    fn entry(channel: &str, other: &str, count: u64, total: u64) -> OverlapEntry {
        OverlapEntry {
            channel: ch(channel),
            other_channel: ch(other),
            overlap_count: count,
            total_chatters_of_channel: total,
        }
    }

    fn count_rows(writer: &SqliteOverlapWriter, table: &str) -> i64 {
        let conn = writer.conn.lock().unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp_file.path()).unwrap();

        run_schema_migrations(&mut conn, SCHEMA_DIR).unwrap();
        run_schema_migrations(&mut conn, SCHEMA_DIR).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        for table in ["users", "streams", "iterations"] {
            let exists: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "missing table {}", table);
        }
    }

    #[test]
    fn test_missing_schema_dir() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp_file.path()).unwrap();

        let result = run_schema_migrations(&mut conn, "/nonexistent/schema");
        assert!(matches!(result, Err(DbError::Schema(_))));
    }

    #[tokio::test]
    async fn test_write_overlap_rows() {
        let (_temp, writer) = create_test_db();
        let rows = vec![entry("a", "b", 2, 3), entry("a", "c", 0, 3)];

        writer.write_overlap_rows(&ch("a"), 7, &rows).await.unwrap();

        let conn = writer.conn.lock().unwrap();
        let result: (i64, String, i64, i64) = conn
            .query_row(
                "SELECT iteration, channel_name, overlap_count, total_chatters
                 FROM overlap_a WHERE channel_name = ?",
                ["b"],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .unwrap();

        assert_eq!(result, (7, "b".to_string(), 2, 3));
    }

    #[tokio::test]
    async fn test_reflush_same_iteration_does_not_duplicate() {
        let (_temp, writer) = create_test_db();

        writer
            .write_overlap_rows(&ch("a"), 3, &[entry("a", "b", 1, 5)])
            .await
            .unwrap();
        writer
            .write_overlap_rows(&ch("a"), 3, &[entry("a", "b", 2, 6)])
            .await
            .unwrap();
        writer
            .write_overlap_rows(&ch("a"), 4, &[entry("a", "b", 4, 6)])
            .await
            .unwrap();

        assert_eq!(count_rows(&writer, "overlap_a"), 2);

        let conn = writer.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT overlap_count FROM overlap_a WHERE iteration = 3",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_ensure_channel_table_twice() {
        let (_temp, writer) = create_test_db();

        writer.ensure_channel_table(&ch("some_channel")).await.unwrap();
        writer.ensure_channel_table(&ch("some_channel")).await.unwrap();

        assert_eq!(count_rows(&writer, "overlap_some_channel"), 0);
    }

    #[tokio::test]
    async fn test_user_table_does_not_collide_with_channel_named_users() {
        let (_temp, writer) = create_test_db();

        writer
            .write_overlap_rows(&ch("users"), 1, &[entry("users", "b", 1, 1)])
            .await
            .unwrap();

        assert_eq!(count_rows(&writer, "overlap_users"), 1);
        assert_eq!(count_rows(&writer, "users"), 0);
    }

    #[tokio::test]
    async fn test_channel_metadata_and_known_channels() {
        let (_temp, writer) = create_test_db();
        let created = Utc.with_ymd_and_hms(2016, 12, 14, 20, 32, 28).unwrap();
        let metadata = vec![
            ChannelMetadata {
                channel: ch("zeta"),
                channel_id: "2".to_string(),
                description: "z".to_string(),
                creation_date: created,
            },
            ChannelMetadata {
                channel: ch("alpha"),
                channel_id: "1".to_string(),
                description: "a".to_string(),
                creation_date: created,
            },
        ];

        writer.write_channel_metadata(&metadata).await.unwrap();
        writer.write_channel_metadata(&metadata[..1]).await.unwrap();

        assert_eq!(count_rows(&writer, "users"), 2);
        assert_eq!(
            writer.load_known_channels().await.unwrap(),
            vec![ch("alpha"), ch("zeta")]
        );
    }

    #[tokio::test]
    async fn test_stream_info_and_iteration_marker() {
        let (_temp, writer) = create_test_db();
        let top = TopChannel {
            channel: ch("a"),
            category: "Just Chatting".to_string(),
            category_id: "509658".to_string(),
            title: "hello".to_string(),
            viewer_count: 1234,
            language: "en".to_string(),
            started_at: Some(Utc::now() - chrono::Duration::seconds(60)),
        };

        writer.write_stream_info(2, &[top.clone()]).await.unwrap();
        writer.write_stream_info(2, &[top]).await.unwrap();
        assert_eq!(count_rows(&writer, "streams"), 1);

        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        writer.write_iteration_marker(2, at).await.unwrap();
        writer.write_iteration_marker(2, at).await.unwrap();

        let conn = writer.conn.lock().unwrap();
        let (viewers, uptime): (i64, i64) = conn
            .query_row(
                "SELECT viewer_count, uptime FROM streams WHERE iteration = 2",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(viewers, 1234);
        assert!(uptime >= 60);

        let stamp: String = conn
            .query_row("SELECT timestamp FROM iterations WHERE iteration = 2", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(stamp, "2024-01-02 03:04:05");
    }
}
