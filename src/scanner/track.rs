//! Cover picture resolution and track building for one probed file.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::NaiveDateTime;
use diesel::sqlite::SqliteConnection;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ScanError;
use super::probe::{MediaTools, ProbeReport, ProbeStream, digest_to_i64};
use super::reconcile::EntityCache;
use super::tags::{NormalizedTags, TagMap, sort_value};
use crate::db::catalog::{self, FileRow, TrackRow, TrackValues};

/// Comment tag value marking the front cover among attached pictures.
const FRONT_COVER_COMMENT: &str = "Cover (front)";

/// Codec recorded when the probe names none.
const UNKNOWN_CODEC: &str = "unknown";

/// Track rows written for one file, and the entities they created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackChanges {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub artists_added: usize,
    pub albums_added: usize,
    pub genres_added: usize,
}

impl TrackChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Cover picture chosen for a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilePicture {
    pub id: Option<i32>,
    /// Whether any picture row of the file was inserted, updated or deleted.
    pub changed: bool,
}

/// Pick the stream holding a file's cover, first match wins:
/// an attached picture commented as the front cover, then an attached picture
/// without a comment, then the first video stream of a still-image file.
pub fn select_cover_stream(report: &ProbeReport) -> Option<&ProbeStream> {
    let attached = || report.streams.iter().filter(|s| s.is_attached_picture());

    attached()
        .find(|s| s.tag("comment") == Some(FRONT_COVER_COMMENT))
        .or_else(|| attached().find(|s| s.tag("comment").is_none()))
        .or_else(|| {
            report
                .is_still_image()
                .then(|| report.streams.iter().find(|s| s.is_video()))
                .flatten()
        })
}

/// Resolve the cover picture of a file and drop every other picture it had.
/// An unchanged digest leaves the picture row untouched.
pub fn resolve_picture(
    conn: &mut SqliteConnection,
    tools: &dyn MediaTools,
    file: &FileRow,
    path: &Path,
    report: &ProbeReport,
    cancel: &CancellationToken,
) -> Result<FilePicture, ScanError> {
    let existing = catalog::file_pictures(conn, file.id)?;
    let mut changed = false;

    let picture_id = match select_cover_stream(report) {
        Some(stream) => {
            let digest = digest_to_i64(&tools.stream_digest(path, stream.index, cancel)?);

            match existing.iter().find(|p| p.stream_index == stream.index) {
                Some(picture) if picture.digest == digest => {
                    debug!(path = %path.display(), stream = stream.index, "Cover unchanged");
                    Some(picture.id)
                }
                Some(picture) => {
                    catalog::update_picture_digest(conn, picture.id, digest)?;
                    changed = true;
                    Some(picture.id)
                }
                None => {
                    changed = true;
                    Some(catalog::insert_picture(conn, file.id, stream.index, digest)?)
                }
            }
        }
        None => None,
    };

    let stale: Vec<i32> = existing
        .iter()
        .map(|p| p.id)
        .filter(|id| Some(*id) != picture_id)
        .collect();
    changed |= catalog::delete_pictures(conn, &stale)? > 0;

    Ok(FilePicture {
        id: picture_id,
        changed,
    })
}

/// File name without its extension.
fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

/// Create, update or delete the tracks of a file so they match its audio
/// streams one to one.
pub fn build_tracks(
    conn: &mut SqliteConnection,
    cache: &mut EntityCache,
    file: &FileRow,
    report: &ProbeReport,
    picture_id: Option<i32>,
    now: NaiveDateTime,
) -> Result<TrackChanges, ScanError> {
    let mut existing: HashMap<i32, TrackRow> = catalog::file_tracks(conn, file.id)?
        .into_iter()
        .map(|track| (track.stream_index, track))
        .collect();
    let mut seen = HashSet::new();
    let mut changes = TrackChanges::default();

    for stream in report.audio_streams() {
        if !seen.insert(stream.index) {
            continue;
        }

        let tags = NormalizedTags::from_tags(&TagMap::merged(report, stream));

        let artist = cache.get_or_add_artist(conn, tags.artist.as_deref(), now)?;
        changes.artists_added += usize::from(artist.created);
        let artist_id = artist.id;

        let album = match tags.album.as_deref() {
            Some(title) => {
                let album_artist_id = match tags.album_artist.as_deref() {
                    Some(name) => {
                        let album_artist = cache.get_or_add_artist(conn, Some(name), now)?;
                        changes.artists_added += usize::from(album_artist.created);
                        Some(album_artist.id)
                    }
                    None if tags.artist.is_some() => Some(artist_id),
                    None => None,
                };
                cache.get_or_add_album(conn, album_artist_id, Some(title), tags.date, now)?
            }
            None => cache.get_or_add_album(conn, None, None, None, now)?,
        };
        changes.albums_added += usize::from(album.created);
        let album_id = album.id;

        let mut genre_ids = Vec::with_capacity(tags.genres.len());
        for genre in &tags.genres {
            let genre = cache.get_or_add_genre(conn, genre)?;
            changes.genres_added += usize::from(genre.created);
            genre_ids.push(genre.id);
        }

        let title = tags.title.clone().unwrap_or_else(|| file_stem(&file.name));
        let bit_rate = stream
            .bit_rate
            .or(report.format_bit_rate())
            .or_else(|| report.packet_bit_rate(stream.index))
            .and_then(|rate| i32::try_from(rate).ok());
        let duration = stream
            .duration
            .or(report.format_duration())
            .or_else(|| report.packet_duration(stream.index));

        let values = TrackValues {
            file_id: file.id,
            stream_index: stream.index,
            codec: stream.codec().unwrap_or(UNKNOWN_CODEC).to_string(),
            bit_rate,
            duration,
            artist_id,
            album_id,
            genre_id: genre_ids.first().copied(),
            picture_id,
            disc_number: tags.disc_number,
            track_number: tags.track_number,
            sort_title: sort_value(tags.title_sort.clone(), Some(title.as_str())),
            title,
            artist_sort: tags.artist_sort.clone(),
            album_artist_sort: tags.album_artist_sort.clone(),
            album_sort: tags.album_sort.clone(),
            date: tags.date,
            original_date: tags.original_date,
            album_gain: tags.album_gain,
            track_gain: tags.track_gain,
        };

        match existing.remove(&stream.index) {
            Some(track) => {
                if track.artist_id != artist_id {
                    catalog::mark_artist_dirty(conn, track.artist_id)?;
                }
                if track.album_id != album_id {
                    catalog::mark_album_dirty(conn, track.album_id)?;
                    if let Some(old_album_artist) = catalog::album_artist_id(conn, track.album_id)? {
                        catalog::mark_artist_dirty(conn, old_album_artist)?;
                    }
                }
                let values_changed = TrackValues::from(&track) != values;
                if values_changed {
                    catalog::update_track(conn, track.id, &values)?;
                }
                let genres_changed = catalog::replace_track_genres(conn, track.id, &genre_ids)?;
                if values_changed || genres_changed {
                    changes.updated += 1;
                }
            }
            None => {
                let track_id = catalog::insert_track(conn, &values)?;
                catalog::replace_track_genres(conn, track_id, &genre_ids)?;
                changes.added += 1;
            }
        }

        if tags.artist.is_some() {
            catalog::mark_artist_dirty(conn, artist_id)?;
        }
        if tags.album_artist.is_some()
            && let Some(album_artist_id) = catalog::album_artist_id(conn, album_id)?
        {
            catalog::mark_artist_dirty(conn, album_artist_id)?;
        }
        if tags.album.is_some() {
            catalog::mark_album_dirty(conn, album_id)?;
        }
    }

    let stale: Vec<i32> = existing.values().map(|track| track.id).collect();
    changes.removed = catalog::delete_tracks(conn, &stale)?;

    Ok(changes)
}
