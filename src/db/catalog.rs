//! Catalog store operations used by the scanner.
//!
//! Everything here takes a plain connection so callers control transaction
//! boundaries. Cascading deletes are performed explicitly, children first,
//! instead of leaning on the foreign key actions alone.

use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use thiserror::Error;

use crate::db::schema::{
    albums, artists, directories, files, genres, libraries, pictures, track_genres, tracks,
};
use crate::models::catalog::{Album, Artist, Genre, Library, Track};

diesel::define_sql_function! {
    /// Row id of the most recent successful insert on this connection.
    fn last_insert_rowid() -> Integer;
}

/// Errors that can occur during catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Still referenced: {0}")]
    InUse(String),
}

// ============================================================================
// Rows
// ============================================================================

/// Database row representation for libraries.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = libraries)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct LibraryRow {
    pub id: i32,
    pub name: String,
    pub path: String,
    pub restricted: bool,
    pub content_modified: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

impl From<LibraryRow> for Library {
    fn from(row: LibraryRow) -> Self {
        Library {
            id: row.id,
            name: row.name,
            path: row.path,
            restricted: row.restricted,
            content_modified: row.content_modified,
            created_at: row.created_at,
        }
    }
}

/// Database row representation for directories.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = directories)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DirectoryRow {
    pub id: i32,
    pub library_id: i32,
    pub parent_id: Option<i32>,
    pub path: String,
    pub added: NaiveDateTime,
}

impl DirectoryRow {
    /// A directory without a parent is the root of its library.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Database row representation for files.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = files)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct FileRow {
    pub id: i32,
    pub library_id: i32,
    pub directory_id: i32,
    pub name: String,
    pub size: i64,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified: i64,
    pub format_name: Option<String>,
    pub added: NaiveDateTime,
}

/// Database row representation for pictures.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = pictures)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PictureRow {
    pub id: i32,
    pub file_id: i32,
    pub stream_index: i32,
    pub digest: i64,
}

/// Database row representation for artists.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = artists)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ArtistRow {
    pub id: i32,
    pub name: Option<String>,
    pub sort_name: Option<String>,
    pub added: NaiveDateTime,
    pub dirty: bool,
}

impl From<ArtistRow> for Artist {
    fn from(row: ArtistRow) -> Self {
        Artist {
            id: row.id,
            name: row.name,
            sort_name: row.sort_name,
            added: row.added,
            dirty: row.dirty,
        }
    }
}

/// Database row representation for albums.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = albums)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AlbumRow {
    pub id: i32,
    pub artist_id: Option<i32>,
    pub picture_id: Option<i32>,
    pub genre_id: Option<i32>,
    pub date: Option<i32>,
    pub original_date: Option<i32>,
    pub title: Option<String>,
    pub sort_title: Option<String>,
    pub added: NaiveDateTime,
    pub dirty: bool,
}

impl From<AlbumRow> for Album {
    fn from(row: AlbumRow) -> Self {
        Album {
            id: row.id,
            artist_id: row.artist_id,
            picture_id: row.picture_id,
            genre_id: row.genre_id,
            date: row.date,
            original_date: row.original_date,
            title: row.title,
            sort_title: row.sort_title,
            added: row.added,
            dirty: row.dirty,
        }
    }
}

/// Database row representation for genres.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = genres)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct GenreRow {
    pub id: i32,
    pub name: String,
}

impl From<GenreRow> for Genre {
    fn from(row: GenreRow) -> Self {
        Genre {
            id: row.id,
            name: row.name,
        }
    }
}

/// Database row representation for tracks.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = tracks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TrackRow {
    pub id: i32,
    pub file_id: i32,
    pub stream_index: i32,
    pub codec: String,
    pub bit_rate: Option<i32>,
    pub duration: Option<f64>,
    pub artist_id: i32,
    pub album_id: i32,
    pub genre_id: Option<i32>,
    pub picture_id: Option<i32>,
    pub disc_number: Option<i32>,
    pub track_number: Option<i32>,
    pub title: String,
    pub sort_title: Option<String>,
    pub artist_sort: Option<String>,
    pub album_artist_sort: Option<String>,
    pub album_sort: Option<String>,
    pub date: Option<i32>,
    pub original_date: Option<i32>,
    pub album_gain: Option<f64>,
    pub track_gain: Option<f64>,
}

impl From<TrackRow> for Track {
    fn from(row: TrackRow) -> Self {
        Track {
            id: row.id,
            file_id: row.file_id,
            stream_index: row.stream_index,
            codec: row.codec,
            bit_rate: row.bit_rate,
            duration: row.duration,
            artist_id: row.artist_id,
            album_id: row.album_id,
            genre_id: row.genre_id,
            picture_id: row.picture_id,
            disc_number: row.disc_number,
            track_number: row.track_number,
            title: row.title,
            sort_title: row.sort_title,
            date: row.date,
            original_date: row.original_date,
            album_gain: row.album_gain,
            track_gain: row.track_gain,
        }
    }
}

/// Data for inserting a new directory.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = directories)]
pub struct NewDirectoryRow<'a> {
    pub library_id: i32,
    pub parent_id: Option<i32>,
    pub path: &'a str,
    pub added: NaiveDateTime,
}

/// Data for inserting a new file.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = files)]
pub struct NewFileRow<'a> {
    pub library_id: i32,
    pub directory_id: i32,
    pub name: &'a str,
    pub size: i64,
    pub modified: i64,
    pub format_name: Option<&'a str>,
    pub added: NaiveDateTime,
}

/// Every scanner-owned column of a track, used for both insert and update.
#[derive(Debug, Clone, PartialEq, Insertable, AsChangeset)]
#[diesel(table_name = tracks, treat_none_as_null = true)]
pub struct TrackValues {
    pub file_id: i32,
    pub stream_index: i32,
    pub codec: String,
    pub bit_rate: Option<i32>,
    pub duration: Option<f64>,
    pub artist_id: i32,
    pub album_id: i32,
    pub genre_id: Option<i32>,
    pub picture_id: Option<i32>,
    pub disc_number: Option<i32>,
    pub track_number: Option<i32>,
    pub title: String,
    pub sort_title: Option<String>,
    pub artist_sort: Option<String>,
    pub album_artist_sort: Option<String>,
    pub album_sort: Option<String>,
    pub date: Option<i32>,
    pub original_date: Option<i32>,
    pub album_gain: Option<f64>,
    pub track_gain: Option<f64>,
}

impl From<&TrackRow> for TrackValues {
    fn from(row: &TrackRow) -> Self {
        TrackValues {
            file_id: row.file_id,
            stream_index: row.stream_index,
            codec: row.codec.clone(),
            bit_rate: row.bit_rate,
            duration: row.duration,
            artist_id: row.artist_id,
            album_id: row.album_id,
            genre_id: row.genre_id,
            picture_id: row.picture_id,
            disc_number: row.disc_number,
            track_number: row.track_number,
            title: row.title.clone(),
            sort_title: row.sort_title.clone(),
            artist_sort: row.artist_sort.clone(),
            album_artist_sort: row.album_artist_sort.clone(),
            album_sort: row.album_sort.clone(),
            date: row.date,
            original_date: row.original_date,
            album_gain: row.album_gain,
            track_gain: row.track_gain,
        }
    }
}

fn last_id(conn: &mut SqliteConnection) -> QueryResult<i32> {
    diesel::select(last_insert_rowid()).get_result(conn)
}

// ============================================================================
// Libraries
// ============================================================================

/// Advance a library's content-modified timestamp. Never moves it backwards.
pub fn bump_content_modified(
    conn: &mut SqliteConnection,
    library_id: i32,
    now: NaiveDateTime,
) -> QueryResult<bool> {
    let current: Option<NaiveDateTime> = libraries::table
        .find(library_id)
        .select(libraries::content_modified)
        .first(conn)?;

    if current.is_some_and(|current| current >= now) {
        return Ok(false);
    }

    diesel::update(libraries::table.find(library_id))
        .set(libraries::content_modified.eq(Some(now)))
        .execute(conn)?;
    Ok(true)
}

/// Delete a library and its whole directory tree.
pub fn delete_library(conn: &mut SqliteConnection, library_id: i32) -> QueryResult<bool> {
    let roots: Vec<i32> = directories::table
        .filter(directories::library_id.eq(library_id))
        .filter(directories::parent_id.is_null())
        .select(directories::id)
        .load(conn)?;

    for root in roots {
        delete_directory(conn, root)?;
    }

    let deleted = diesel::delete(libraries::table.find(library_id)).execute(conn)?;
    Ok(deleted > 0)
}

// ============================================================================
// Directories
// ============================================================================

/// Find the root directory recorded for a library.
pub fn find_root_directory(
    conn: &mut SqliteConnection,
    library_id: i32,
) -> QueryResult<Option<DirectoryRow>> {
    directories::table
        .filter(directories::library_id.eq(library_id))
        .filter(directories::parent_id.is_null())
        .select(DirectoryRow::as_select())
        .first(conn)
        .optional()
}

/// Insert a directory and return the stored row.
pub fn insert_directory(
    conn: &mut SqliteConnection,
    new_directory: &NewDirectoryRow,
) -> QueryResult<DirectoryRow> {
    diesel::insert_into(directories::table)
        .values(new_directory)
        .execute(conn)?;

    directories::table
        .filter(directories::library_id.eq(new_directory.library_id))
        .filter(directories::path.eq(new_directory.path))
        .select(DirectoryRow::as_select())
        .first(conn)
}

/// Direct subdirectories of a directory.
pub fn child_directories(
    conn: &mut SqliteConnection,
    parent_id: i32,
) -> QueryResult<Vec<DirectoryRow>> {
    directories::table
        .filter(directories::parent_id.eq(parent_id))
        .select(DirectoryRow::as_select())
        .order(directories::path.asc())
        .load(conn)
}

/// Ids of a directory and all of its descendants.
fn directory_subtree(conn: &mut SqliteConnection, root_id: i32) -> QueryResult<Vec<i32>> {
    let mut ids = vec![root_id];
    let mut frontier = vec![root_id];

    while !frontier.is_empty() {
        let children: Vec<i32> = directories::table
            .filter(directories::parent_id.eq_any(&frontier))
            .select(directories::id)
            .load(conn)?;
        ids.extend_from_slice(&children);
        frontier = children;
    }

    Ok(ids)
}

/// Delete a directory with its subdirectories, files, tracks and pictures.
/// Returns the number of directories removed.
pub fn delete_directory(conn: &mut SqliteConnection, directory_id: i32) -> QueryResult<usize> {
    let directory_ids = directory_subtree(conn, directory_id)?;

    let file_ids: Vec<i32> = files::table
        .filter(files::directory_id.eq_any(&directory_ids))
        .select(files::id)
        .load(conn)?;
    delete_files(conn, &file_ids)?;

    diesel::delete(directories::table.filter(directories::id.eq_any(&directory_ids)))
        .execute(conn)
}

// ============================================================================
// Files
// ============================================================================

/// Files directly inside a directory.
pub fn directory_files(conn: &mut SqliteConnection, directory_id: i32) -> QueryResult<Vec<FileRow>> {
    files::table
        .filter(files::directory_id.eq(directory_id))
        .select(FileRow::as_select())
        .order(files::name.asc())
        .load(conn)
}

/// Insert a file and return the stored row.
pub fn insert_file(conn: &mut SqliteConnection, new_file: &NewFileRow) -> QueryResult<FileRow> {
    diesel::insert_into(files::table)
        .values(new_file)
        .execute(conn)?;

    files::table
        .filter(files::directory_id.eq(new_file.directory_id))
        .filter(files::name.eq(new_file.name))
        .select(FileRow::as_select())
        .first(conn)
}

/// Record the size, modification time and container format of a probed file.
pub fn update_file(
    conn: &mut SqliteConnection,
    file_id: i32,
    size: i64,
    modified: i64,
    format_name: Option<&str>,
) -> QueryResult<usize> {
    diesel::update(files::table.find(file_id))
        .set((
            files::size.eq(size),
            files::modified.eq(modified),
            files::format_name.eq(format_name),
        ))
        .execute(conn)
}

/// Delete files together with their tracks and pictures.
pub fn delete_files(conn: &mut SqliteConnection, file_ids: &[i32]) -> QueryResult<usize> {
    if file_ids.is_empty() {
        return Ok(0);
    }

    let track_ids: Vec<i32> = tracks::table
        .filter(tracks::file_id.eq_any(file_ids))
        .select(tracks::id)
        .load(conn)?;
    delete_tracks(conn, &track_ids)?;

    let picture_ids: Vec<i32> = pictures::table
        .filter(pictures::file_id.eq_any(file_ids))
        .select(pictures::id)
        .load(conn)?;
    delete_pictures(conn, &picture_ids)?;

    diesel::delete(files::table.filter(files::id.eq_any(file_ids))).execute(conn)
}

// ============================================================================
// Pictures
// ============================================================================

/// Pictures attached to a file, ordered by stream index.
pub fn file_pictures(conn: &mut SqliteConnection, file_id: i32) -> QueryResult<Vec<PictureRow>> {
    pictures::table
        .filter(pictures::file_id.eq(file_id))
        .select(PictureRow::as_select())
        .order(pictures::stream_index.asc())
        .load(conn)
}

pub fn insert_picture(
    conn: &mut SqliteConnection,
    file_id: i32,
    stream_index: i32,
    digest: i64,
) -> QueryResult<i32> {
    diesel::insert_into(pictures::table)
        .values((
            pictures::file_id.eq(file_id),
            pictures::stream_index.eq(stream_index),
            pictures::digest.eq(digest),
        ))
        .execute(conn)?;
    last_id(conn)
}

pub fn update_picture_digest(
    conn: &mut SqliteConnection,
    picture_id: i32,
    digest: i64,
) -> QueryResult<usize> {
    diesel::update(pictures::table.find(picture_id))
        .set(pictures::digest.eq(digest))
        .execute(conn)
}

/// Delete pictures. Albums using one of them as cover lose it and are marked
/// dirty so the fixup pass picks a new one.
pub fn delete_pictures(conn: &mut SqliteConnection, picture_ids: &[i32]) -> QueryResult<usize> {
    if picture_ids.is_empty() {
        return Ok(0);
    }

    diesel::update(albums::table.filter(albums::picture_id.eq_any(picture_ids)))
        .set((albums::picture_id.eq(None::<i32>), albums::dirty.eq(true)))
        .execute(conn)?;

    diesel::update(tracks::table.filter(tracks::picture_id.eq_any(picture_ids)))
        .set(tracks::picture_id.eq(None::<i32>))
        .execute(conn)?;

    diesel::delete(pictures::table.filter(pictures::id.eq_any(picture_ids))).execute(conn)
}

/// Give every track of the given files without a cover the given picture.
/// Returns the number of tracks updated.
pub fn set_missing_track_pictures(
    conn: &mut SqliteConnection,
    file_ids: &[i32],
    picture_id: i32,
) -> QueryResult<usize> {
    let album_ids: BTreeSet<i32> = tracks::table
        .filter(tracks::file_id.eq_any(file_ids))
        .filter(tracks::picture_id.is_null())
        .select(tracks::album_id)
        .load::<i32>(conn)?
        .into_iter()
        .collect();

    if album_ids.is_empty() {
        return Ok(0);
    }

    let updated = diesel::update(
        tracks::table
            .filter(tracks::file_id.eq_any(file_ids))
            .filter(tracks::picture_id.is_null()),
    )
    .set(tracks::picture_id.eq(Some(picture_id)))
    .execute(conn)?;

    diesel::update(albums::table.filter(albums::id.eq_any(&album_ids)))
        .set(albums::dirty.eq(true))
        .execute(conn)?;

    Ok(updated)
}

// ============================================================================
// Tracks
// ============================================================================

/// Tracks of a file, ordered by stream index.
pub fn file_tracks(conn: &mut SqliteConnection, file_id: i32) -> QueryResult<Vec<TrackRow>> {
    tracks::table
        .filter(tracks::file_id.eq(file_id))
        .select(TrackRow::as_select())
        .order(tracks::stream_index.asc())
        .load(conn)
}

pub fn insert_track(conn: &mut SqliteConnection, values: &TrackValues) -> QueryResult<i32> {
    diesel::insert_into(tracks::table)
        .values(values)
        .execute(conn)?;
    last_id(conn)
}

pub fn update_track(
    conn: &mut SqliteConnection,
    track_id: i32,
    values: &TrackValues,
) -> QueryResult<usize> {
    diesel::update(tracks::table.find(track_id))
        .set(values)
        .execute(conn)
}

/// Replace the genre associations of a track. Returns false and writes
/// nothing when the track already has exactly these genres.
pub fn replace_track_genres(
    conn: &mut SqliteConnection,
    track_id: i32,
    genre_ids: &[i32],
) -> QueryResult<bool> {
    let current: BTreeSet<i32> = track_genres::table
        .filter(track_genres::track_id.eq(track_id))
        .select(track_genres::genre_id)
        .load::<i32>(conn)?
        .into_iter()
        .collect();
    if current == genre_ids.iter().copied().collect::<BTreeSet<_>>() {
        return Ok(false);
    }

    diesel::delete(track_genres::table.filter(track_genres::track_id.eq(track_id)))
        .execute(conn)?;

    for genre_id in genre_ids {
        diesel::insert_into(track_genres::table)
            .values((
                track_genres::track_id.eq(track_id),
                track_genres::genre_id.eq(genre_id),
            ))
            .on_conflict_do_nothing()
            .execute(conn)?;
    }

    Ok(true)
}

/// Delete tracks, marking the artists and albums they fed as dirty.
pub fn delete_tracks(conn: &mut SqliteConnection, track_ids: &[i32]) -> QueryResult<usize> {
    if track_ids.is_empty() {
        return Ok(0);
    }

    let references: Vec<(i32, i32)> = tracks::table
        .filter(tracks::id.eq_any(track_ids))
        .select((tracks::artist_id, tracks::album_id))
        .load(conn)?;

    let mut artist_ids: BTreeSet<i32> = references.iter().map(|(artist, _)| *artist).collect();
    let album_ids: BTreeSet<i32> = references.iter().map(|(_, album)| *album).collect();

    let album_artists: Vec<Option<i32>> = albums::table
        .filter(albums::id.eq_any(&album_ids))
        .select(albums::artist_id)
        .load(conn)?;
    artist_ids.extend(album_artists.into_iter().flatten());

    diesel::update(artists::table.filter(artists::id.eq_any(&artist_ids)))
        .set(artists::dirty.eq(true))
        .execute(conn)?;
    diesel::update(albums::table.filter(albums::id.eq_any(&album_ids)))
        .set(albums::dirty.eq(true))
        .execute(conn)?;

    diesel::delete(track_genres::table.filter(track_genres::track_id.eq_any(track_ids)))
        .execute(conn)?;
    diesel::delete(tracks::table.filter(tracks::id.eq_any(track_ids))).execute(conn)
}

// ============================================================================
// Artists, albums, genres
// ============================================================================

/// Look up an artist by name; `None` finds the unknown artist.
pub fn find_artist(conn: &mut SqliteConnection, name: Option<&str>) -> QueryResult<Option<i32>> {
    let query = artists::table.select(artists::id).into_boxed();
    let query = match name {
        Some(name) => query.filter(artists::name.eq(name)),
        None => query.filter(artists::name.is_null()),
    };

    query.order(artists::id.asc()).first(conn).optional()
}

pub fn insert_artist(
    conn: &mut SqliteConnection,
    name: Option<&str>,
    added: NaiveDateTime,
) -> QueryResult<i32> {
    diesel::insert_into(artists::table)
        .values((
            artists::name.eq(name),
            artists::added.eq(added),
            artists::dirty.eq(false),
        ))
        .execute(conn)?;
    last_id(conn)
}

/// Look up an album by artist, title and year-bucketed date, where `None`
/// only matches `None`.
pub fn find_album(
    conn: &mut SqliteConnection,
    artist_id: Option<i32>,
    title: Option<&str>,
    date: Option<i32>,
) -> QueryResult<Option<i32>> {
    let mut query = albums::table.select(albums::id).into_boxed();

    query = match artist_id {
        Some(artist_id) => query.filter(albums::artist_id.eq(artist_id)),
        None => query.filter(albums::artist_id.is_null()),
    };
    query = match title {
        Some(title) => query.filter(albums::title.eq(title)),
        None => query.filter(albums::title.is_null()),
    };
    query = match date {
        Some(date) => query.filter(albums::date.eq(date)),
        None => query.filter(albums::date.is_null()),
    };

    query.order(albums::id.asc()).first(conn).optional()
}

pub fn insert_album(
    conn: &mut SqliteConnection,
    artist_id: Option<i32>,
    title: Option<&str>,
    date: Option<i32>,
    added: NaiveDateTime,
) -> QueryResult<i32> {
    diesel::insert_into(albums::table)
        .values((
            albums::artist_id.eq(artist_id),
            albums::title.eq(title),
            albums::date.eq(date),
            albums::added.eq(added),
            albums::dirty.eq(false),
        ))
        .execute(conn)?;
    last_id(conn)
}

pub fn find_genre(conn: &mut SqliteConnection, name: &str) -> QueryResult<Option<i32>> {
    genres::table
        .filter(genres::name.eq(name))
        .select(genres::id)
        .first(conn)
        .optional()
}

pub fn insert_genre(conn: &mut SqliteConnection, name: &str) -> QueryResult<i32> {
    diesel::insert_into(genres::table)
        .values(genres::name.eq(name))
        .execute(conn)?;
    last_id(conn)
}

pub fn mark_artist_dirty(conn: &mut SqliteConnection, artist_id: i32) -> QueryResult<usize> {
    diesel::update(artists::table.find(artist_id))
        .set(artists::dirty.eq(true))
        .execute(conn)
}

pub fn mark_album_dirty(conn: &mut SqliteConnection, album_id: i32) -> QueryResult<usize> {
    diesel::update(albums::table.find(album_id))
        .set(albums::dirty.eq(true))
        .execute(conn)
}

/// Artist credited on an album, if any.
pub fn album_artist_id(conn: &mut SqliteConnection, album_id: i32) -> QueryResult<Option<i32>> {
    let artist_id: Option<Option<i32>> = albums::table
        .find(album_id)
        .select(albums::artist_id)
        .first(conn)
        .optional()?;
    Ok(artist_id.flatten())
}

pub fn dirty_artist_ids(conn: &mut SqliteConnection) -> QueryResult<Vec<i32>> {
    artists::table
        .filter(artists::dirty.eq(true))
        .select(artists::id)
        .order(artists::id.asc())
        .load(conn)
}

pub fn dirty_album_ids(conn: &mut SqliteConnection) -> QueryResult<Vec<i32>> {
    albums::table
        .filter(albums::dirty.eq(true))
        .select(albums::id)
        .order(albums::id.asc())
        .load(conn)
}

/// Delete an artist that no track or album references.
pub fn delete_artist(conn: &mut SqliteConnection, artist_id: i32) -> Result<(), CatalogError> {
    let track_refs: i64 = tracks::table
        .filter(tracks::artist_id.eq(artist_id))
        .count()
        .get_result(conn)?;
    let album_refs: i64 = albums::table
        .filter(albums::artist_id.eq(artist_id))
        .count()
        .get_result(conn)?;

    if track_refs + album_refs > 0 {
        return Err(CatalogError::InUse(format!("artist {}", artist_id)));
    }

    let deleted = diesel::delete(artists::table.find(artist_id)).execute(conn)?;
    if deleted == 0 {
        return Err(CatalogError::NotFound(format!("artist {}", artist_id)));
    }
    Ok(())
}

/// Delete an album that no track references.
pub fn delete_album(conn: &mut SqliteConnection, album_id: i32) -> Result<(), CatalogError> {
    let track_refs: i64 = tracks::table
        .filter(tracks::album_id.eq(album_id))
        .count()
        .get_result(conn)?;

    if track_refs > 0 {
        return Err(CatalogError::InUse(format!("album {}", album_id)));
    }

    let deleted = diesel::delete(albums::table.find(album_id)).execute(conn)?;
    if deleted == 0 {
        return Err(CatalogError::NotFound(format!("album {}", album_id)));
    }
    Ok(())
}

/// Delete a genre that no track, track association or album references.
pub fn delete_genre(conn: &mut SqliteConnection, genre_id: i32) -> Result<(), CatalogError> {
    let track_refs: i64 = tracks::table
        .filter(tracks::genre_id.eq(genre_id))
        .count()
        .get_result(conn)?;
    let association_refs: i64 = track_genres::table
        .filter(track_genres::genre_id.eq(genre_id))
        .count()
        .get_result(conn)?;
    let album_refs: i64 = albums::table
        .filter(albums::genre_id.eq(genre_id))
        .count()
        .get_result(conn)?;

    if track_refs + association_refs + album_refs > 0 {
        return Err(CatalogError::InUse(format!("genre {}", genre_id)));
    }

    let deleted = diesel::delete(genres::table.find(genre_id)).execute(conn)?;
    if deleted == 0 {
        return Err(CatalogError::NotFound(format!("genre {}", genre_id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::run_migrations;

    fn connection() -> SqliteConnection {
        use diesel::connection::SimpleConnection;

        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        conn.batch_execute("PRAGMA foreign_keys = ON;").unwrap();
        run_migrations(&mut conn).unwrap();
        conn
    }

    fn now() -> NaiveDateTime {
        chrono::Utc::now().naive_utc()
    }

    fn library(conn: &mut SqliteConnection) -> i32 {
        diesel::insert_into(libraries::table)
            .values((libraries::name.eq("Music"), libraries::path.eq("/music")))
            .execute(conn)
            .unwrap();
        last_id(conn).unwrap()
    }

    fn track_values(file_id: i32, artist_id: i32, album_id: i32) -> TrackValues {
        TrackValues {
            file_id,
            stream_index: 0,
            codec: "flac".to_string(),
            bit_rate: None,
            duration: None,
            artist_id,
            album_id,
            genre_id: None,
            picture_id: None,
            disc_number: None,
            track_number: None,
            title: "Song".to_string(),
            sort_title: None,
            artist_sort: None,
            album_artist_sort: None,
            album_sort: None,
            date: None,
            original_date: None,
            album_gain: None,
            track_gain: None,
        }
    }

    #[test]
    fn test_null_keys_match_only_null() {
        let mut conn = connection();
        let unknown = insert_artist(&mut conn, None, now()).unwrap();
        let named = insert_artist(&mut conn, Some("Low"), now()).unwrap();

        assert_eq!(find_artist(&mut conn, None).unwrap(), Some(unknown));
        assert_eq!(find_artist(&mut conn, Some("Low")).unwrap(), Some(named));
        assert_eq!(find_artist(&mut conn, Some("High")).unwrap(), None);

        let placeholder = insert_album(&mut conn, None, None, None, now()).unwrap();
        let real = insert_album(&mut conn, Some(named), Some("Things"), Some(20040000), now()).unwrap();
        assert_eq!(find_album(&mut conn, None, None, None).unwrap(), Some(placeholder));
        assert_eq!(
            find_album(&mut conn, Some(named), Some("Things"), Some(20040000)).unwrap(),
            Some(real)
        );
        assert_eq!(find_album(&mut conn, Some(named), Some("Things"), None).unwrap(), None);
    }

    #[test]
    fn test_delete_directory_cascades_and_marks_dirty() {
        let mut conn = connection();
        let library_id = library(&mut conn);
        let root = insert_directory(
            &mut conn,
            &NewDirectoryRow { library_id, parent_id: None, path: "/music", added: now() },
        )
        .unwrap();
        let child = insert_directory(
            &mut conn,
            &NewDirectoryRow { library_id, parent_id: Some(root.id), path: "/music/a", added: now() },
        )
        .unwrap();
        let file = insert_file(
            &mut conn,
            &NewFileRow {
                library_id,
                directory_id: child.id,
                name: "song.flac",
                size: 1,
                modified: 1,
                format_name: Some("flac"),
                added: now(),
            },
        )
        .unwrap();
        let artist = insert_artist(&mut conn, Some("Low"), now()).unwrap();
        let album = insert_album(&mut conn, Some(artist), Some("Things"), None, now()).unwrap();
        let picture = insert_picture(&mut conn, file.id, 1, 42).unwrap();
        diesel::update(albums::table.find(album))
            .set(albums::picture_id.eq(Some(picture)))
            .execute(&mut conn)
            .unwrap();
        insert_track(&mut conn, &track_values(file.id, artist, album)).unwrap();

        assert_eq!(delete_directory(&mut conn, child.id).unwrap(), 1);

        let remaining_files: i64 = files::table.count().get_result(&mut conn).unwrap();
        let remaining_tracks: i64 = tracks::table.count().get_result(&mut conn).unwrap();
        let remaining_pictures: i64 = pictures::table.count().get_result(&mut conn).unwrap();
        assert_eq!((remaining_files, remaining_tracks, remaining_pictures), (0, 0, 0));

        let (cover, album_dirty): (Option<i32>, bool) = albums::table
            .find(album)
            .select((albums::picture_id, albums::dirty))
            .first(&mut conn)
            .unwrap();
        assert_eq!(cover, None);
        assert!(album_dirty);
        let artist_dirty: bool = artists::table
            .find(artist)
            .select(artists::dirty)
            .first(&mut conn)
            .unwrap();
        assert!(artist_dirty);
        assert!(find_root_directory(&mut conn, library_id).unwrap().is_some());
    }

    #[test]
    fn test_restrict_on_delete() {
        let mut conn = connection();
        let library_id = library(&mut conn);
        let root = insert_directory(
            &mut conn,
            &NewDirectoryRow { library_id, parent_id: None, path: "/music", added: now() },
        )
        .unwrap();
        let file = insert_file(
            &mut conn,
            &NewFileRow {
                library_id,
                directory_id: root.id,
                name: "song.mp3",
                size: 1,
                modified: 1,
                format_name: None,
                added: now(),
            },
        )
        .unwrap();
        let artist = insert_artist(&mut conn, None, now()).unwrap();
        let album = insert_album(&mut conn, None, None, None, now()).unwrap();
        let genre = insert_genre(&mut conn, "Rock").unwrap();
        let track = insert_track(&mut conn, &track_values(file.id, artist, album)).unwrap();
        assert!(replace_track_genres(&mut conn, track, &[genre]).unwrap());
        assert!(!replace_track_genres(&mut conn, track, &[genre, genre]).unwrap());

        assert!(matches!(delete_artist(&mut conn, artist), Err(CatalogError::InUse(_))));
        assert!(matches!(delete_album(&mut conn, album), Err(CatalogError::InUse(_))));
        assert!(matches!(delete_genre(&mut conn, genre), Err(CatalogError::InUse(_))));

        delete_files(&mut conn, &[file.id]).unwrap();
        delete_genre(&mut conn, genre).unwrap();
        delete_album(&mut conn, album).unwrap();
        delete_artist(&mut conn, artist).unwrap();
        assert!(matches!(delete_artist(&mut conn, artist), Err(CatalogError::NotFound(_))));
    }

    #[test]
    fn test_content_modified_only_advances() {
        let mut conn = connection();
        let library_id = library(&mut conn);
        let later = now();
        let earlier = later - chrono::Duration::hours(1);

        assert!(bump_content_modified(&mut conn, library_id, later).unwrap());
        assert!(!bump_content_modified(&mut conn, library_id, earlier).unwrap());

        let stored: Option<NaiveDateTime> = libraries::table
            .find(library_id)
            .select(libraries::content_modified)
            .first(&mut conn)
            .unwrap();
        assert_eq!(stored, Some(later));
    }
}
