//! Pool-backed repositories for library administration and catalog reads.

use std::path::PathBuf;

use diesel::prelude::*;
use serde::Serialize;

use crate::db::DbPool;
use crate::db::catalog::{
    self, AlbumRow, ArtistRow, CatalogError, GenreRow, LibraryRow, TrackRow,
};
use crate::db::schema::{
    albums, artists, directories, files, genres, libraries, pictures, track_genres, tracks,
};
use crate::models::catalog::{Album, Artist, Genre, Library, NewLibrary, Track};

// ============================================================================
// Library Repository
// ============================================================================

/// Data for inserting a new library.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = libraries)]
pub struct NewLibraryRow<'a> {
    pub name: &'a str,
    pub path: &'a str,
    pub restricted: bool,
}

impl<'a> From<&'a NewLibrary> for NewLibraryRow<'a> {
    fn from(library: &'a NewLibrary) -> Self {
        Self {
            name: &library.name,
            path: &library.path,
            restricted: library.restricted,
        }
    }
}

/// Repository for library database operations.
#[derive(Clone)]
pub struct LibraryRepository {
    pool: DbPool,
}

impl LibraryRepository {
    /// Create a new library repository.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get all libraries ordered by name.
    pub fn find_all(&self) -> Result<Vec<Library>, CatalogError> {
        let mut conn = self.pool.get()?;

        let results = libraries::table
            .select(LibraryRow::as_select())
            .order(libraries::name.asc())
            .load(&mut conn)?;

        Ok(results.into_iter().map(Library::from).collect())
    }

    /// Find a library by ID.
    pub fn find_by_id(&self, library_id: i32) -> Result<Option<Library>, CatalogError> {
        let mut conn = self.pool.get()?;

        let result = libraries::table
            .filter(libraries::id.eq(library_id))
            .select(LibraryRow::as_select())
            .first(&mut conn)
            .optional()?;

        Ok(result.map(Library::from))
    }

    /// Find a library by name.
    pub fn find_by_name(&self, name: &str) -> Result<Option<Library>, CatalogError> {
        let mut conn = self.pool.get()?;

        let result = libraries::table
            .filter(libraries::name.eq(name))
            .select(LibraryRow::as_select())
            .first(&mut conn)
            .optional()?;

        Ok(result.map(Library::from))
    }

    /// Register a new library.
    pub fn create(&self, new_library: &NewLibrary) -> Result<Library, CatalogError> {
        let mut conn = self.pool.get()?;

        let existing = libraries::table
            .filter(libraries::name.eq(&new_library.name))
            .count()
            .get_result::<i64>(&mut conn)?;

        if existing > 0 {
            return Err(CatalogError::AlreadyExists(new_library.name.clone()));
        }

        let row: NewLibraryRow = new_library.into();
        diesel::insert_into(libraries::table)
            .values(&row)
            .execute(&mut conn)?;

        let library = libraries::table
            .filter(libraries::name.eq(&new_library.name))
            .select(LibraryRow::as_select())
            .first(&mut conn)?;

        Ok(Library::from(library))
    }

    /// Point a library at a new root path. The next scan rebuilds its tree.
    pub fn set_path(&self, library_id: i32, path: &str) -> Result<bool, CatalogError> {
        let mut conn = self.pool.get()?;

        let updated = diesel::update(libraries::table.filter(libraries::id.eq(library_id)))
            .set(libraries::path.eq(path))
            .execute(&mut conn)?;

        Ok(updated > 0)
    }

    /// Delete a library together with everything cataloged under it.
    /// Artists, albums and genres stay behind, marked dirty where affected.
    pub fn delete(&self, library_id: i32) -> Result<bool, CatalogError> {
        let mut conn = self.pool.get()?;

        let deleted = conn.transaction::<_, CatalogError, _>(|conn| {
            Ok(catalog::delete_library(conn, library_id)?)
        })?;

        Ok(deleted)
    }
}

// ============================================================================
// Catalog Repository
// ============================================================================

/// Row counts of every catalog table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatalogCounts {
    pub libraries: i64,
    pub directories: i64,
    pub files: i64,
    pub pictures: i64,
    pub artists: i64,
    pub albums: i64,
    pub genres: i64,
    pub tracks: i64,
}

/// Read-side access to cataloged entities.
#[derive(Clone)]
pub struct CatalogRepository {
    pool: DbPool,
}

impl CatalogRepository {
    /// Create a new catalog repository.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn counts(&self) -> Result<CatalogCounts, CatalogError> {
        let mut conn = self.pool.get()?;

        Ok(CatalogCounts {
            libraries: libraries::table.count().get_result(&mut conn)?,
            directories: directories::table.count().get_result(&mut conn)?,
            files: files::table.count().get_result(&mut conn)?,
            pictures: pictures::table.count().get_result(&mut conn)?,
            artists: artists::table.count().get_result(&mut conn)?,
            albums: albums::table.count().get_result(&mut conn)?,
            genres: genres::table.count().get_result(&mut conn)?,
            tracks: tracks::table.count().get_result(&mut conn)?,
        })
    }

    /// All artists, ordered by sort name falling back to name.
    pub fn artists(&self) -> Result<Vec<Artist>, CatalogError> {
        let mut conn = self.pool.get()?;

        let mut results: Vec<Artist> = artists::table
            .select(ArtistRow::as_select())
            .load(&mut conn)?
            .into_iter()
            .map(Artist::from)
            .collect();

        results.sort_by(|a, b| {
            let a_key = a.sort_name.as_ref().or(a.name.as_ref());
            let b_key = b.sort_name.as_ref().or(b.name.as_ref());
            a_key.cmp(&b_key).then(a.id.cmp(&b.id))
        });
        Ok(results)
    }

    /// All albums except the placeholder, ordered by sort title falling back
    /// to title.
    pub fn albums(&self) -> Result<Vec<Album>, CatalogError> {
        let mut conn = self.pool.get()?;

        let mut results: Vec<Album> = albums::table
            .filter(albums::title.is_not_null())
            .select(AlbumRow::as_select())
            .load(&mut conn)?
            .into_iter()
            .map(Album::from)
            .collect();

        results.sort_by(|a, b| {
            let a_key = a.sort_title.as_ref().or(a.title.as_ref());
            let b_key = b.sort_title.as_ref().or(b.title.as_ref());
            a_key.cmp(&b_key).then(a.id.cmp(&b.id))
        });
        Ok(results)
    }

    pub fn genres(&self) -> Result<Vec<Genre>, CatalogError> {
        let mut conn = self.pool.get()?;

        let results = genres::table
            .select(GenreRow::as_select())
            .order(genres::name.asc())
            .load(&mut conn)?;

        Ok(results.into_iter().map(Genre::from).collect())
    }

    pub fn find_artist(&self, artist_id: i32) -> Result<Option<Artist>, CatalogError> {
        let mut conn = self.pool.get()?;

        let result = artists::table
            .filter(artists::id.eq(artist_id))
            .select(ArtistRow::as_select())
            .first(&mut conn)
            .optional()?;

        Ok(result.map(Artist::from))
    }

    pub fn find_artist_by_name(&self, name: &str) -> Result<Option<Artist>, CatalogError> {
        let mut conn = self.pool.get()?;

        let result = artists::table
            .filter(artists::name.eq(name))
            .select(ArtistRow::as_select())
            .first(&mut conn)
            .optional()?;

        Ok(result.map(Artist::from))
    }

    pub fn find_album(&self, album_id: i32) -> Result<Option<Album>, CatalogError> {
        let mut conn = self.pool.get()?;

        let result = albums::table
            .filter(albums::id.eq(album_id))
            .select(AlbumRow::as_select())
            .first(&mut conn)
            .optional()?;

        Ok(result.map(Album::from))
    }

    /// Albums carrying the given title, across all artists and years.
    pub fn find_albums_by_title(&self, title: &str) -> Result<Vec<Album>, CatalogError> {
        let mut conn = self.pool.get()?;

        let results = albums::table
            .filter(albums::title.eq(title))
            .select(AlbumRow::as_select())
            .order(albums::id.asc())
            .load(&mut conn)?;

        Ok(results.into_iter().map(Album::from).collect())
    }

    /// Tracks of an album in disc and track order.
    pub fn album_tracks(&self, album_id: i32) -> Result<Vec<Track>, CatalogError> {
        let mut conn = self.pool.get()?;

        let results = tracks::table
            .filter(tracks::album_id.eq(album_id))
            .select(TrackRow::as_select())
            .order((
                tracks::disc_number.asc(),
                tracks::track_number.asc(),
                tracks::id.asc(),
            ))
            .load(&mut conn)?;

        Ok(results.into_iter().map(Track::from).collect())
    }

    /// Every track in the catalog, ordered by id.
    pub fn tracks(&self) -> Result<Vec<Track>, CatalogError> {
        let mut conn = self.pool.get()?;

        let results = tracks::table
            .select(TrackRow::as_select())
            .order(tracks::id.asc())
            .load(&mut conn)?;

        Ok(results.into_iter().map(Track::from).collect())
    }

    /// Names of every genre a track is associated with.
    pub fn track_genre_names(&self, track_id: i32) -> Result<Vec<String>, CatalogError> {
        let mut conn = self.pool.get()?;

        let names = track_genres::table
            .inner_join(genres::table)
            .filter(track_genres::track_id.eq(track_id))
            .select(genres::name)
            .order(genres::name.asc())
            .load(&mut conn)?;

        Ok(names)
    }

    /// Paths of every cataloged directory in a library, sorted.
    pub fn directory_paths(&self, library_id: i32) -> Result<Vec<PathBuf>, CatalogError> {
        let mut conn = self.pool.get()?;

        let paths: Vec<String> = directories::table
            .filter(directories::library_id.eq(library_id))
            .select(directories::path)
            .order(directories::path.asc())
            .load(&mut conn)?;

        Ok(paths.into_iter().map(PathBuf::from).collect())
    }

    /// Full paths of every cataloged file in a library, sorted.
    pub fn file_paths(&self, library_id: i32) -> Result<Vec<PathBuf>, CatalogError> {
        let mut conn = self.pool.get()?;

        let rows: Vec<(String, String)> = files::table
            .inner_join(directories::table)
            .filter(files::library_id.eq(library_id))
            .select((directories::path, files::name))
            .load(&mut conn)?;

        let mut paths: Vec<PathBuf> = rows
            .into_iter()
            .map(|(directory, name)| PathBuf::from(directory).join(name))
            .collect();
        paths.sort();
        Ok(paths)
    }

    pub fn delete_artist(&self, artist_id: i32) -> Result<(), CatalogError> {
        let mut conn = self.pool.get()?;
        catalog::delete_artist(&mut conn, artist_id)
    }

    pub fn delete_album(&self, album_id: i32) -> Result<(), CatalogError> {
        let mut conn = self.pool.get()?;
        catalog::delete_album(&mut conn, album_id)
    }

    pub fn delete_genre(&self, genre_id: i32) -> Result<(), CatalogError> {
        let mut conn = self.pool.get()?;
        catalog::delete_genre(&mut conn, genre_id)
    }
}
