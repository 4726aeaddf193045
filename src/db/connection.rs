//! Database connection pool and management.

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PoolError, PooledConnection};
use diesel::sqlite::SqliteConnection;
use std::time::Duration;

/// Type alias for our connection pool.
pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

/// Type alias for a pooled connection.
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Connection timeout in seconds.
    pub connection_timeout: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "catalog.db".to_string(),
            max_connections: 10,
            connection_timeout: 30,
        }
    }
}

impl DbConfig {
    /// Create a new database configuration.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    /// Build a connection pool from this configuration.
    pub fn build_pool(&self) -> Result<DbPool, PoolError> {
        let manager = ConnectionManager::<SqliteConnection>::new(&self.database_url);

        Pool::builder()
            .max_size(self.max_connections)
            .connection_timeout(Duration::from_secs(self.connection_timeout))
            .connection_customizer(Box::new(ConnectionOptions {
                busy_timeout: Duration::from_secs(self.connection_timeout),
            }))
            .build(manager)
    }
}

/// Per-connection pragmas. SQLite only enforces the cascade/restrict actions
/// of the catalog when `foreign_keys` is switched on for every connection.
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    busy_timeout: Duration,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL; PRAGMA busy_timeout = {};",
            self.busy_timeout.as_millis()
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Run the SQL migrations to set up the database schema.
pub fn run_migrations(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    // Create libraries table
    diesel::sql_query(
        r#"
        CREATE TABLE IF NOT EXISTS libraries (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            name TEXT NOT NULL UNIQUE,
            path TEXT NOT NULL,
            restricted BOOLEAN NOT NULL DEFAULT FALSE,
            content_modified TIMESTAMP,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(conn)?;

    // Create directories table
    diesel::sql_query(
        r#"
        CREATE TABLE IF NOT EXISTS directories (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            library_id INTEGER NOT NULL REFERENCES libraries(id) ON DELETE CASCADE,
            parent_id INTEGER REFERENCES directories(id) ON DELETE CASCADE,
            path TEXT NOT NULL,
            added TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (library_id, path)
        )
        "#,
    )
    .execute(conn)?;

    diesel::sql_query(
        "CREATE INDEX IF NOT EXISTS idx_directories_parent_id ON directories(parent_id)"
    )
    .execute(conn)?;

    // Create files table
    diesel::sql_query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            library_id INTEGER NOT NULL REFERENCES libraries(id) ON DELETE CASCADE,
            directory_id INTEGER NOT NULL REFERENCES directories(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            size BIGINT NOT NULL DEFAULT 0,
            modified BIGINT NOT NULL DEFAULT 0,
            format_name TEXT,
            added TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (directory_id, name)
        )
        "#,
    )
    .execute(conn)?;

    // Create pictures table
    diesel::sql_query(
        r#"
        CREATE TABLE IF NOT EXISTS pictures (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            stream_index INTEGER NOT NULL,
            digest BIGINT NOT NULL,
            UNIQUE (file_id, stream_index)
        )
        "#,
    )
    .execute(conn)?;

    // Create artists table
    diesel::sql_query(
        r#"
        CREATE TABLE IF NOT EXISTS artists (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            name TEXT,
            sort_name TEXT,
            added TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            dirty BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    )
    .execute(conn)?;

    diesel::sql_query(
        "CREATE INDEX IF NOT EXISTS idx_artists_name ON artists(name)"
    )
    .execute(conn)?;

    // Create genres table
    diesel::sql_query(
        r#"
        CREATE TABLE IF NOT EXISTS genres (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            name TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(conn)?;

    // Create albums table
    diesel::sql_query(
        r#"
        CREATE TABLE IF NOT EXISTS albums (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            artist_id INTEGER REFERENCES artists(id) ON DELETE RESTRICT,
            picture_id INTEGER REFERENCES pictures(id) ON DELETE SET NULL,
            genre_id INTEGER REFERENCES genres(id) ON DELETE RESTRICT,
            date INTEGER,
            original_date INTEGER,
            title TEXT,
            sort_title TEXT,
            added TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            dirty BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    )
    .execute(conn)?;

    diesel::sql_query(
        "CREATE INDEX IF NOT EXISTS idx_albums_title ON albums(title)"
    )
    .execute(conn)?;

    diesel::sql_query(
        "CREATE INDEX IF NOT EXISTS idx_albums_artist_id ON albums(artist_id)"
    )
    .execute(conn)?;

    // Create tracks table
    diesel::sql_query(
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            stream_index INTEGER NOT NULL,
            codec TEXT NOT NULL,
            bit_rate INTEGER,
            duration DOUBLE,
            artist_id INTEGER NOT NULL REFERENCES artists(id) ON DELETE RESTRICT,
            album_id INTEGER NOT NULL REFERENCES albums(id) ON DELETE RESTRICT,
            genre_id INTEGER REFERENCES genres(id) ON DELETE RESTRICT,
            picture_id INTEGER REFERENCES pictures(id) ON DELETE SET NULL,
            disc_number INTEGER,
            track_number INTEGER,
            title TEXT NOT NULL,
            sort_title TEXT,
            artist_sort TEXT,
            album_artist_sort TEXT,
            album_sort TEXT,
            date INTEGER,
            original_date INTEGER,
            album_gain DOUBLE,
            track_gain DOUBLE,
            UNIQUE (file_id, stream_index)
        )
        "#,
    )
    .execute(conn)?;

    diesel::sql_query(
        "CREATE INDEX IF NOT EXISTS idx_tracks_album_id ON tracks(album_id)"
    )
    .execute(conn)?;

    diesel::sql_query(
        "CREATE INDEX IF NOT EXISTS idx_tracks_artist_id ON tracks(artist_id)"
    )
    .execute(conn)?;

    // Create track_genres table
    diesel::sql_query(
        r#"
        CREATE TABLE IF NOT EXISTS track_genres (
            track_id INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
            genre_id INTEGER NOT NULL REFERENCES genres(id) ON DELETE RESTRICT,
            PRIMARY KEY (track_id, genre_id)
        )
        "#,
    )
    .execute(conn)?;

    Ok(())
}
