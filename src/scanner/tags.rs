//! Tag normalization.
//!
//! Maps the tag dictionaries reported by the probe tool onto canonical track
//! fields. Each field tries a fixed list of key spellings (Vorbis comments,
//! ID3v2 frames, iTunes/APE names) and takes the first one present. Values
//! that fail to parse are dropped, never reported as errors.

use std::collections::HashMap;

use super::probe::{ProbeReport, ProbeStream};

const TITLE_KEYS: &[&str] = &["title", "tit2"];
const TITLE_SORT_KEYS: &[&str] = &["titlesort", "title-sort", "sort_name", "tsot"];
const ARTIST_KEYS: &[&str] = &["artist", "tpe1", "author"];
const ARTIST_SORT_KEYS: &[&str] = &["artistsort", "artist-sort", "sort_artist", "tsop"];
const ALBUM_KEYS: &[&str] = &["album", "talb"];
const ALBUM_SORT_KEYS: &[&str] = &["albumsort", "album-sort", "sort_album", "tsoa"];
const ALBUM_ARTIST_KEYS: &[&str] = &["album_artist", "albumartist", "album artist", "tpe2"];
const ALBUM_ARTIST_SORT_KEYS: &[&str] = &[
    "albumartistsort",
    "album_artist-sort",
    "album_artist_sort",
    "sort_album_artist",
    "tso2",
];
const DISC_KEYS: &[&str] = &["disc", "discnumber", "disk", "tpos"];
const TRACK_KEYS: &[&str] = &["track", "tracknumber", "trck"];
const DATE_KEYS: &[&str] = &["date", "year", "tdrc", "tyer"];
const ORIGINAL_DATE_KEYS: &[&str] = &["originaldate", "tdor", "originalyear", "tory"];
const GENRE_KEYS: &[&str] = &["genre", "tcon"];

const R128_TRACK_GAIN_KEY: &str = "r128_track_gain";
const R128_ALBUM_GAIN_KEY: &str = "r128_album_gain";
const REPLAYGAIN_TRACK_GAIN_KEYS: &[&str] = &["replaygain_track_gain", "replay gain track gain"];
const REPLAYGAIN_ALBUM_GAIN_KEYS: &[&str] = &["replaygain_album_gain", "replay gain album gain"];

/// Offset between the R128 reference level and the ReplayGain one, in dB.
const R128_TRACK_GAIN_OFFSET_DB: f64 = 5.0;

/// Merged tag dictionary with lower-cased keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMap(HashMap<String, String>);

impl TagMap {
    /// Format-level tags overlaid with the stream's own tags.
    pub fn merged(report: &ProbeReport, stream: &ProbeStream) -> Self {
        let mut tags = TagMap::default();
        if let Some(format) = &report.format {
            tags.extend(&format.tags);
        }
        tags.extend(&stream.tags);
        tags
    }

    /// Keys of one level that differ only by case are applied in byte order,
    /// so an all lower-case spelling wins over `TITLE` or `Title`.
    fn extend(&mut self, tags: &HashMap<String, String>) {
        let mut entries: Vec<_> = tags.iter().collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        for (key, value) in entries {
            self.0.insert(key.to_lowercase(), value.clone());
        }
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// First non-blank value among `keys`, trimmed.
    fn first(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|key| self.get(key))
            .map(str::trim)
            .find(|value| !value.is_empty())
    }

    fn first_string(&self, keys: &[&str]) -> Option<String> {
        self.first(keys).map(str::to_string)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut tags = TagMap::default();
        for (key, value) in iter {
            let key: String = key.into();
            tags.insert(&key, value);
        }
        tags
    }
}

/// Canonical fields derived from a tag dictionary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedTags {
    pub title: Option<String>,
    pub title_sort: Option<String>,
    pub artist: Option<String>,
    pub artist_sort: Option<String>,
    pub album: Option<String>,
    pub album_sort: Option<String>,
    pub album_artist: Option<String>,
    pub album_artist_sort: Option<String>,
    pub disc_number: Option<i32>,
    pub track_number: Option<i32>,
    pub date: Option<i32>,
    pub original_date: Option<i32>,
    pub genres: Vec<String>,
    pub album_gain: Option<f64>,
    pub track_gain: Option<f64>,
}

impl NormalizedTags {
    pub fn from_tags(tags: &TagMap) -> Self {
        let title = tags.first_string(TITLE_KEYS);
        let artist = tags.first_string(ARTIST_KEYS);
        let album = tags.first_string(ALBUM_KEYS);
        let album_artist = tags.first_string(ALBUM_ARTIST_KEYS);

        Self {
            title_sort: sort_value(tags.first_string(TITLE_SORT_KEYS), title.as_deref()),
            artist_sort: sort_value(tags.first_string(ARTIST_SORT_KEYS), artist.as_deref()),
            album_sort: sort_value(tags.first_string(ALBUM_SORT_KEYS), album.as_deref()),
            album_artist_sort: sort_value(
                tags.first_string(ALBUM_ARTIST_SORT_KEYS),
                album_artist.as_deref(),
            ),
            title,
            artist,
            album,
            album_artist,
            disc_number: tags.first(DISC_KEYS).and_then(parse_position),
            track_number: tags.first(TRACK_KEYS).and_then(parse_position),
            date: tags.first(DATE_KEYS).and_then(parse_date),
            original_date: tags.first(ORIGINAL_DATE_KEYS).and_then(parse_date),
            genres: tags.first(GENRE_KEYS).map(split_genres).unwrap_or_default(),
            album_gain: album_gain(tags),
            track_gain: track_gain(tags),
        }
    }
}

/// A sort value equal to its display value carries no information.
pub fn sort_value(sort: Option<String>, display: Option<&str>) -> Option<String> {
    sort.filter(|sort| Some(sort.as_str()) != display)
}

/// Disc or track position: `N` or `N/M`, keeping `N` when it is positive.
pub fn parse_position(value: &str) -> Option<i32> {
    let numerator = value.split('/').next()?.trim();
    numerator.parse::<i32>().ok().filter(|n| *n > 0)
}

/// `YYYY`, `YYYY-MM` or `YYYY-MM-DD[Thh:mm:ss…]` as `YYYYMMDD` with unknown
/// parts set to zero.
pub fn parse_date(value: &str) -> Option<i32> {
    let value = value.trim();
    let date = value
        .split_once(['T', ' '])
        .map_or(value, |(date, _)| date);

    let mut parts = date.split('-');
    let year: i32 = parse_digits(parts.next()?, 4)?;
    let month: i32 = match parts.next() {
        Some(part) => parse_digits(part, 2).filter(|m| (1..=12).contains(m))?,
        None => 0,
    };
    let day: i32 = match parts.next() {
        Some(part) => parse_digits(part, 2).filter(|d| (1..=31).contains(d))?,
        None => 0,
    };
    if parts.next().is_some() || year == 0 {
        return None;
    }

    Some(year * 10_000 + month * 100 + day)
}

/// Parse exactly `len` ASCII digits.
fn parse_digits(part: &str, len: usize) -> Option<i32> {
    if part.len() != len || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

/// R128 gain: a Q7.8 fixed-point integer (dB × 256).
pub fn parse_r128_gain(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<i32>()
        .ok()
        .map(|raw| f64::from(raw) / 256.0)
}

/// Classic ReplayGain value: `±X.XX dB`.
pub fn parse_replaygain(value: &str) -> Option<f64> {
    let value = value.trim();
    let number = value
        .strip_suffix("dB")
        .or_else(|| value.strip_suffix("db"))
        .or_else(|| value.strip_suffix("DB"))
        .unwrap_or(value)
        .trim();

    number.parse::<f64>().ok().filter(|gain| gain.is_finite())
}

fn track_gain(tags: &TagMap) -> Option<f64> {
    tags.first(&[R128_TRACK_GAIN_KEY])
        .and_then(parse_r128_gain)
        .map(|gain| gain + R128_TRACK_GAIN_OFFSET_DB)
        .or_else(|| tags.first(REPLAYGAIN_TRACK_GAIN_KEYS).and_then(parse_replaygain))
}

fn album_gain(tags: &TagMap) -> Option<f64> {
    tags.first(&[R128_ALBUM_GAIN_KEY])
        .and_then(parse_r128_gain)
        .or_else(|| tags.first(REPLAYGAIN_ALBUM_GAIN_KEYS).and_then(parse_replaygain))
}

/// Split a genre value on `;` and NUL, dropping blanks and repeats.
pub fn split_genres(value: &str) -> Vec<String> {
    let mut genres: Vec<String> = Vec::new();
    for genre in value.split([';', '\0']).map(str::trim) {
        if !genre.is_empty() && !genres.iter().any(|g| g == genre) {
            genres.push(genre.to_string());
        }
    }
    genres
}
