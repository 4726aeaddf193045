//! Music catalog models.
//!
//! Dates are stored as `YYYYMMDD`-style integers where an unknown month or
//! day is encoded as `0` (`2004-07` is `20040700`).

use chrono::NaiveDateTime;

/// A library: a named root directory whose content is cataloged.
#[derive(Debug, Clone)]
pub struct Library {
    pub id: i32,
    pub name: String,
    pub path: String,
    /// Access-control flag, interpreted by the serving layer.
    pub restricted: bool,
    /// Bumped whenever a directory or file under this library changes.
    pub content_modified: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

/// Data for registering a new library.
#[derive(Debug, Clone)]
pub struct NewLibrary {
    pub name: String,
    pub path: String,
    pub restricted: bool,
}

impl NewLibrary {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            restricted: false,
        }
    }
}

/// An artist. A `None` name is the "unknown artist", deduplicated like any
/// other name.
#[derive(Debug, Clone)]
pub struct Artist {
    pub id: i32,
    pub name: Option<String>,
    pub sort_name: Option<String>,
    pub added: NaiveDateTime,
    pub dirty: bool,
}

/// An album. A `None` title marks the placeholder album holding tracks
/// without album metadata; it never shows up in album listings.
#[derive(Debug, Clone)]
pub struct Album {
    pub id: i32,
    pub artist_id: Option<i32>,
    pub picture_id: Option<i32>,
    pub genre_id: Option<i32>,
    /// Year-bucketed release date (`YYYY0000`).
    pub date: Option<i32>,
    pub original_date: Option<i32>,
    pub title: Option<String>,
    pub sort_title: Option<String>,
    pub added: NaiveDateTime,
    pub dirty: bool,
}

impl Album {
    pub fn is_placeholder(&self) -> bool {
        self.title.is_none()
    }

    pub fn year(&self) -> Option<i32> {
        self.date.map(|date| date / 10_000)
    }
}

/// A genre.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Genre {
    pub id: i32,
    pub name: String,
}

/// One audio stream of a cataloged file.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: i32,
    pub file_id: i32,
    pub stream_index: i32,
    pub codec: String,
    pub bit_rate: Option<i32>,
    /// Duration in seconds.
    pub duration: Option<f64>,
    pub artist_id: i32,
    pub album_id: i32,
    pub genre_id: Option<i32>,
    pub picture_id: Option<i32>,
    pub disc_number: Option<i32>,
    pub track_number: Option<i32>,
    pub title: String,
    pub sort_title: Option<String>,
    pub date: Option<i32>,
    pub original_date: Option<i32>,
    /// ReplayGain values in dB.
    pub album_gain: Option<f64>,
    pub track_gain: Option<f64>,
}

/// Bucket a `YYYYMMDD` date by year, dropping month and day.
pub fn year_bucket(date: i32) -> i32 {
    date / 10_000 * 10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_bucket() {
        assert_eq!(year_bucket(20040715), 20040000);
        assert_eq!(year_bucket(20040000), 20040000);
        assert_eq!(year_bucket(19991231), 19990000);
    }
}
