//! Get-or-create for artists, albums and genres.
//!
//! A scan unit of work may meet the same new artist many times before it
//! commits. [`EntityCache`] remembers every id resolved or created since the
//! last commit boundary and is consulted before the store.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use crate::db::catalog;
use crate::models::catalog::year_bucket;

/// Natural key of an album. The date is already bucketed by year.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AlbumKey {
    artist_id: Option<i32>,
    title: Option<String>,
    date: Option<i32>,
}

/// Outcome of resolving an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub id: i32,
    pub created: bool,
}

/// Ids resolved within the current unit of work.
#[derive(Debug, Default)]
pub struct EntityCache {
    artists: HashMap<Option<String>, i32>,
    albums: HashMap<AlbumKey, i32>,
    genres: HashMap<String, i32>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything. Called at every commit or rollback boundary.
    pub fn clear(&mut self) {
        self.artists.clear();
        self.albums.clear();
        self.genres.clear();
    }

    pub fn get_or_add_artist(
        &mut self,
        conn: &mut SqliteConnection,
        name: Option<&str>,
        now: NaiveDateTime,
    ) -> QueryResult<Resolved> {
        let key = name.map(str::to_string);
        if let Some(&id) = self.artists.get(&key) {
            return Ok(Resolved { id, created: false });
        }

        let resolved = match catalog::find_artist(conn, name)? {
            Some(id) => Resolved { id, created: false },
            None => Resolved {
                id: catalog::insert_artist(conn, name, now)?,
                created: true,
            },
        };

        self.artists.insert(key, resolved.id);
        Ok(resolved)
    }

    /// Resolve an album by artist, title and the year of `date`. A `None`
    /// title is the placeholder album, distinct from every real one.
    pub fn get_or_add_album(
        &mut self,
        conn: &mut SqliteConnection,
        artist_id: Option<i32>,
        title: Option<&str>,
        date: Option<i32>,
        now: NaiveDateTime,
    ) -> QueryResult<Resolved> {
        let key = AlbumKey {
            artist_id,
            title: title.map(str::to_string),
            date: date.map(year_bucket),
        };
        if let Some(&id) = self.albums.get(&key) {
            return Ok(Resolved { id, created: false });
        }

        let resolved = match catalog::find_album(conn, key.artist_id, title, key.date)? {
            Some(id) => Resolved { id, created: false },
            None => Resolved {
                id: catalog::insert_album(conn, key.artist_id, title, key.date, now)?,
                created: true,
            },
        };

        self.albums.insert(key, resolved.id);
        Ok(resolved)
    }

    pub fn get_or_add_genre(
        &mut self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> QueryResult<Resolved> {
        if let Some(&id) = self.genres.get(name) {
            return Ok(Resolved { id, created: false });
        }

        let resolved = match catalog::find_genre(conn, name)? {
            Some(id) => Resolved { id, created: false },
            None => Resolved {
                id: catalog::insert_genre(conn, name)?,
                created: true,
            },
        };

        self.genres.insert(name.to_string(), resolved.id);
        Ok(resolved)
    }
}
