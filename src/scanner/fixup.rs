//! Recomputation of aggregates derived from many tracks.
//!
//! Every dirty artist and album is fixed in its own transaction, so an
//! interrupted pass leaves the remaining entities dirty for the next run.

use diesel::prelude::*;
use diesel::sql_types::{Integer, Text};
use diesel::sqlite::SqliteConnection;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ScanError;
use super::tags::sort_value;
use crate::db::catalog;
use crate::db::schema::{albums, artists, tracks};

/// Entities recomputed by one fixup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixupSummary {
    pub artists: usize,
    pub albums: usize,
}

#[derive(QueryableByName)]
struct TextValue {
    #[diesel(sql_type = Text)]
    value: String,
}

#[derive(QueryableByName)]
struct IntValue {
    #[diesel(sql_type = Integer)]
    value: i32,
}

/// Fix every dirty artist, then every dirty album.
pub fn run_fixups(
    conn: &mut SqliteConnection,
    cancel: &CancellationToken,
) -> Result<FixupSummary, ScanError> {
    let mut summary = FixupSummary::default();

    for artist_id in catalog::dirty_artist_ids(conn)? {
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        conn.transaction::<_, diesel::result::Error, _>(|conn| fix_artist(conn, artist_id))?;
        summary.artists += 1;
    }

    for album_id in catalog::dirty_album_ids(conn)? {
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        conn.transaction::<_, diesel::result::Error, _>(|conn| fix_album(conn, album_id))?;
        summary.albums += 1;
    }

    Ok(summary)
}

/// Sort name: the most frequent artist-sort value among the artist's tracks,
/// counting album-artist sort values of tracks on the artist's albums.
pub fn fix_artist(conn: &mut SqliteConnection, artist_id: i32) -> QueryResult<()> {
    let name: Option<String> = artists::table
        .find(artist_id)
        .select(artists::name)
        .first(conn)?;

    let sort_name = diesel::sql_query(
        r#"
        SELECT value FROM (
            SELECT artist_sort AS value FROM tracks
            WHERE artist_id = ? AND artist_sort IS NOT NULL
            UNION ALL
            SELECT t.album_artist_sort AS value FROM tracks t
            JOIN albums a ON a.id = t.album_id
            WHERE a.artist_id = ? AND t.album_artist_sort IS NOT NULL
        )
        GROUP BY value
        ORDER BY COUNT(*) DESC, value ASC
        LIMIT 1
        "#,
    )
    .bind::<Integer, _>(artist_id)
    .bind::<Integer, _>(artist_id)
    .get_result::<TextValue>(conn)
    .optional()?
    .map(|row| row.value);

    let sort_name = sort_value(sort_name, name.as_deref());
    debug!(artist_id, sort_name = ?sort_name, "Fixed artist");

    diesel::update(artists::table.find(artist_id))
        .set((artists::sort_name.eq(sort_name), artists::dirty.eq(false)))
        .execute(conn)?;
    Ok(())
}

/// Cover, genre, sort title and original date of an album.
pub fn fix_album(conn: &mut SqliteConnection, album_id: i32) -> QueryResult<()> {
    let title: Option<String> = albums::table
        .find(album_id)
        .select(albums::title)
        .first(conn)?;

    // Absent disc and track numbers sort last.
    let picture_id = diesel::sql_query(
        r#"
        SELECT picture_id AS value FROM tracks
        WHERE album_id = ? AND picture_id IS NOT NULL
        ORDER BY COALESCE(disc_number, 2147483647), COALESCE(track_number, 2147483647), id
        LIMIT 1
        "#,
    )
    .bind::<Integer, _>(album_id)
    .get_result::<IntValue>(conn)
    .optional()?
    .map(|row| row.value);

    let genre_id = diesel::sql_query(
        r#"
        SELECT genre_id AS value FROM tracks
        WHERE album_id = ? AND genre_id IS NOT NULL
        GROUP BY genre_id
        ORDER BY COUNT(*) DESC, genre_id ASC
        LIMIT 1
        "#,
    )
    .bind::<Integer, _>(album_id)
    .get_result::<IntValue>(conn)
    .optional()?
    .map(|row| row.value);

    let sort_title = diesel::sql_query(
        r#"
        SELECT album_sort AS value FROM tracks
        WHERE album_id = ? AND album_sort IS NOT NULL
        GROUP BY album_sort
        ORDER BY COUNT(*) DESC, album_sort ASC
        LIMIT 1
        "#,
    )
    .bind::<Integer, _>(album_id)
    .get_result::<TextValue>(conn)
    .optional()?
    .map(|row| row.value);
    let sort_title = sort_value(sort_title, title.as_deref());

    let original_date: Option<i32> = tracks::table
        .filter(tracks::album_id.eq(album_id))
        .select(diesel::dsl::max(tracks::original_date))
        .first(conn)?;

    debug!(album_id, ?picture_id, ?genre_id, ?sort_title, "Fixed album");

    diesel::update(albums::table.find(album_id))
        .set((
            albums::picture_id.eq(picture_id),
            albums::genre_id.eq(genre_id),
            albums::sort_title.eq(sort_title),
            albums::original_date.eq(original_date),
            albums::dirty.eq(false),
        ))
        .execute(conn)?;
    Ok(())
}
