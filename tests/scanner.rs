mod common;

use std::fs;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use common::{Harness, image};
use music_catalog::db::schema::{files, pictures, tracks};
use music_catalog::db::{CatalogError, CatalogRepository, LibraryRepository};
use music_catalog::scanner::{ScanError, ScanRequest};

fn catalog(h: &Harness) -> CatalogRepository {
    CatalogRepository::new(h.pool.clone())
}

fn picture_of(h: &Harness, file_name: &str) -> i32 {
    let mut conn = h.pool.get().unwrap();
    pictures::table
        .inner_join(files::table)
        .filter(files::name.eq(file_name))
        .select(pictures::id)
        .first(&mut conn)
        .unwrap()
}

fn content_modified(h: &Harness) -> Option<NaiveDateTime> {
    LibraryRepository::new(h.pool.clone())
        .find_by_id(h.library.id)
        .unwrap()
        .unwrap()
        .content_modified
}

fn execute(h: &Harness, sql: &str) {
    let mut conn = h.pool.get().unwrap();
    diesel::sql_query(sql).execute(&mut conn).unwrap();
}

/// Audio with an embedded front cover at stream 1.
fn audio_with_cover(tags: Value) -> Value {
    json!({
        "format": {"format_name": "flac", "duration": "10", "bit_rate": "1000", "tags": tags},
        "streams": [
            {"index": 0, "codec_type": "audio", "codec_name": "flac"},
            {"index": 1, "codec_type": "video", "codec_name": "png",
             "disposition": {"attached_pic": 1}, "tags": {"comment": "Cover (front)"}}
        ]
    })
}

fn track_picture(h: &Harness, file_name: &str) -> Option<i32> {
    let mut conn = h.pool.get().unwrap();
    tracks::table
        .inner_join(files::table)
        .filter(files::name.eq(file_name))
        .select(tracks::picture_id)
        .first(&mut conn)
        .unwrap()
}

#[test]
fn test_second_incremental_scan_changes_nothing() {
    let h = Harness::new();
    h.add_track("Low/Things/01.flac", &[("artist", "Low"), ("album", "Things"), ("track", "1")]);
    h.add_track("Low/Things/02.flac", &[("artist", "Low"), ("album", "Things"), ("track", "2")]);
    h.write("Low/Things/cover.jpg", "jpeg");
    h.tools.report("cover.jpg", image());

    let first = h.scan();
    assert_eq!(first.directories_added, 3);
    assert_eq!(first.files_added, 3);
    assert_eq!(first.tracks_added, 2);
    assert_eq!(first.covers_applied, 2);
    assert!(!first.is_unchanged());
    let probes = h.tools.probe_count();

    let second = h.scan();
    assert!(second.is_unchanged(), "{:?}", second);
    assert_eq!(second.files_skipped, 3);
    assert_eq!(h.tools.probe_count(), probes);
}

#[test]
fn test_entities_are_deduplicated_across_directories() {
    let h = Harness::new();
    for (path, disc) in [("Album/CD1/01.flac", "1"), ("Album/CD1/02.flac", "1"), ("Album/CD2/03.flac", "2")] {
        h.add_track(
            path,
            &[
                ("ARTIST", "Low"),
                ("album", "Things"),
                ("date", "2004-07-15"),
                ("disc", disc),
                ("genre", "Rock;Slowcore"),
            ],
        );
    }

    let summary = h.scan();
    assert_eq!(summary.artists_added, 1);
    assert_eq!(summary.albums_added, 1);
    assert_eq!(summary.genres_added, 2);

    let counts = catalog(&h).counts().unwrap();
    assert_eq!(counts.artists, 1);
    assert_eq!(counts.albums, 1);
    assert_eq!(counts.genres, 2);
    assert_eq!(counts.tracks, 3);

    let albums = catalog(&h).albums().unwrap();
    assert_eq!(albums[0].title.as_deref(), Some("Things"));
    assert_eq!(albums[0].year(), Some(2004));

    let track = &catalog(&h).album_tracks(albums[0].id).unwrap()[0];
    assert_eq!(catalog(&h).track_genre_names(track.id).unwrap(), vec!["Rock", "Slowcore"]);
}

#[test]
fn test_catalog_mirrors_the_tree() {
    let h = Harness::new();
    h.add_track("A/one.flac", &[("title", "One")]);
    h.add_track("A/B/two.flac", &[("title", "Two")]);
    h.add_track("C/three.flac", &[("title", "Three")]);
    h.scan();

    fs::remove_dir_all(h.path("A/B")).unwrap();
    fs::remove_file(h.path("C/three.flac")).unwrap();
    h.add_track("C/D/four.flac", &[("title", "Four")]);

    let summary = h.scan();
    assert_eq!(summary.directories_removed, 1);
    assert_eq!(summary.directories_added, 1);
    assert_eq!(summary.files_removed, 1);
    assert_eq!(summary.files_added, 1);

    let id = h.library.id;
    assert_eq!(
        catalog(&h).file_paths(id).unwrap(),
        vec![h.path("A/one.flac"), h.path("C/D/four.flac")]
    );
    assert_eq!(
        catalog(&h).directory_paths(id).unwrap(),
        vec![h.music.path().to_path_buf(), h.path("A"), h.path("C"), h.path("C/D")]
    );
    let titles: Vec<String> = catalog(&h).tracks().unwrap().into_iter().map(|t| t.title).collect();
    assert_eq!(titles, vec!["One", "Four"]);
}

#[test]
fn test_unprobeable_file_is_removed_and_scan_continues() {
    let h = Harness::new();
    h.write("notes.txt", "not audio");
    h.add_track("song.flac", &[("title", "Song")]);

    let summary = h.scan();
    assert_eq!(summary.files_failed, 1);
    assert_eq!(summary.files_added, 1);
    assert_eq!(catalog(&h).file_paths(h.library.id).unwrap(), vec![h.path("song.flac")]);
}

#[test]
fn test_changed_file_is_reprobed() {
    let h = Harness::new();
    let path = h.add_track("song.flac", &[("title", "Old")]);
    h.scan();

    fs::write(&path, "a longer payload than before").unwrap();
    h.tools.report("song.flac", common::audio(&[("title", "New")]));

    let summary = h.scan();
    assert_eq!(summary.files_updated, 1);
    assert_eq!(summary.tracks_updated, 1);
    assert_eq!(catalog(&h).tracks().unwrap()[0].title, "New");
}

#[test]
fn test_forced_scan_reprobes_unchanged_files() {
    let h = Harness::new();
    h.add_track("one.flac", &[("title", "One")]);
    h.add_track("two.flac", &[("title", "Two")]);
    h.scan();
    let probes = h.tools.probe_count();

    let summary = h
        .scanner()
        .scan(&ScanRequest::new(true), &CancellationToken::new(), None)
        .unwrap();
    assert_eq!(summary.files_updated, 2);
    assert_eq!(summary.files_skipped, 0);
    assert_eq!(summary.tracks_updated, 0);
    assert_eq!(h.tools.probe_count(), probes + 2);
}

#[test]
fn test_covers() {
    let h = Harness::new();
    h.add_track("Album/01.flac", &[("album", "Record"), ("artist", "Band"), ("track", "1")]);
    h.write("Album/02.flac", "embedded");
    h.tools.report(
        "02.flac",
        audio_with_cover(json!({"album": "Record", "artist": "Band", "track": "2"})),
    );
    h.write("Album/cover.png", "png");
    h.tools.report("cover.png", image());
    h.write("Album/cover.jpg", "jpeg");
    h.tools.report("cover.jpg", image());

    let summary = h.scan();
    assert_eq!(summary.covers_applied, 1);

    let embedded = picture_of(&h, "02.flac");
    let folder_cover = picture_of(&h, "cover.jpg");
    assert_eq!(track_picture(&h, "02.flac"), Some(embedded));
    assert_eq!(track_picture(&h, "01.flac"), Some(folder_cover));

    // The album takes the cover of its first track.
    let album = &catalog(&h).find_albums_by_title("Record").unwrap()[0];
    assert_eq!(album.picture_id, Some(folder_cover));
}

#[test]
fn test_changed_cover_keeps_picture_row() {
    let h = Harness::new();
    h.add_track("Album/01.flac", &[("album", "Record")]);
    let cover = h.write("Album/cover.jpg", "jpeg");
    h.tools.report("cover.jpg", image());
    h.tools.digest("cover.jpg", &[1, 2, 3]);
    h.scan();
    let before = picture_of(&h, "cover.jpg");

    fs::write(&cover, "another jpeg").unwrap();
    h.tools.digest("cover.jpg", &[4, 5, 6]);
    h.scan();

    assert_eq!(picture_of(&h, "cover.jpg"), before);
    assert_eq!(track_picture(&h, "01.flac"), Some(before));
}

#[test]
fn test_fixups_pick_most_frequent_values() {
    let h = Harness::new();
    for (name, sort) in [("1.flac", "A"), ("2.flac", "A"), ("3.flac", "B")] {
        h.add_track(
            name,
            &[
                ("album", "The Record"),
                ("album_artist", "The Band"),
                ("albumsort", sort),
                ("album_artist_sort", "Band, The"),
                ("artist", "Guest"),
                ("genre", if sort == "A" { "Rock" } else { "Jazz" }),
                ("originaldate", if sort == "A" { "1969" } else { "1971-02" }),
            ],
        );
    }

    let summary = h.scan();
    assert_eq!(summary.albums_fixed, 1);

    let repo = catalog(&h);
    let album = &repo.find_albums_by_title("The Record").unwrap()[0];
    assert_eq!(album.sort_title.as_deref(), Some("A"));
    assert_eq!(album.original_date, Some(19710200));
    assert!(!album.dirty);

    let rock = repo.genres().unwrap().into_iter().find(|g| g.name == "Rock").unwrap();
    assert_eq!(album.genre_id, Some(rock.id));

    let band = repo.find_artist_by_name("The Band").unwrap().unwrap();
    assert_eq!(album.artist_id, Some(band.id));
    assert_eq!(band.sort_name.as_deref(), Some("Band, The"));
}

#[test]
fn test_tracks_without_album_share_the_placeholder() {
    let h = Harness::new();
    h.add_track("a.flac", &[("artist", "One")]);
    h.add_track("b.flac", &[("artist", "Two")]);
    h.add_track("c.flac", &[]);
    h.scan();

    let repo = catalog(&h);
    assert_eq!(repo.counts().unwrap().albums, 1);
    assert!(repo.albums().unwrap().is_empty());

    let tracks = repo.tracks().unwrap();
    assert!(tracks.iter().all(|t| t.album_id == tracks[0].album_id));
    let placeholder = repo.find_album(tracks[0].album_id).unwrap().unwrap();
    assert!(placeholder.is_placeholder());
    assert_eq!(placeholder.artist_id, None);
    // Untitled tracks fall back to the file name.
    assert_eq!(tracks[2].title, "c");
    assert_eq!(repo.counts().unwrap().artists, 3);
}

#[test]
fn test_missing_root_is_skipped_not_deleted() {
    let h = Harness::new();
    h.add_track("song.flac", &[("title", "Song")]);
    h.scan();

    fs::remove_dir_all(h.music.path()).unwrap();
    let summary = h.scan();

    assert!(summary.is_unchanged());
    assert_eq!(catalog(&h).file_paths(h.library.id).unwrap(), vec![h.path("song.flac")]);
}

#[test]
fn test_moved_library_replaces_tree() {
    let h = Harness::new();
    h.add_track("song.flac", &[("title", "Song")]);
    h.scan();

    let moved = tempfile::tempdir().unwrap();
    fs::write(moved.path().join("other.flac"), "other").unwrap();
    h.tools.report("other.flac", common::audio(&[("title", "Other")]));

    let libraries = LibraryRepository::new(h.pool.clone());
    libraries
        .set_path(h.library.id, moved.path().to_str().unwrap())
        .unwrap();
    let summary = h.scan();

    assert_eq!(summary.files_added, 1);
    assert_eq!(
        catalog(&h).file_paths(h.library.id).unwrap(),
        vec![moved.path().join("other.flac")]
    );
}

#[test]
fn test_referenced_entities_cannot_be_deleted() {
    let h = Harness::new();
    h.add_track("song.flac", &[("artist", "Low"), ("album", "Things"), ("genre", "Rock")]);
    h.scan();

    let repo = catalog(&h);
    let artist = repo.find_artist_by_name("Low").unwrap().unwrap();
    let album = &repo.find_albums_by_title("Things").unwrap()[0];
    let genre = &repo.genres().unwrap()[0];

    assert!(matches!(repo.delete_artist(artist.id), Err(CatalogError::InUse(_))));
    assert!(matches!(repo.delete_album(album.id), Err(CatalogError::InUse(_))));
    assert!(matches!(repo.delete_genre(genre.id), Err(CatalogError::InUse(_))));
    assert!(matches!(repo.delete_artist(9999), Err(CatalogError::NotFound(_))));
}

#[test]
fn test_removing_library_removes_its_tree() {
    let h = Harness::new();
    h.add_track("Dir/song.flac", &[("title", "Song")]);
    h.scan();

    assert!(LibraryRepository::new(h.pool.clone()).delete(h.library.id).unwrap());

    let counts = catalog(&h).counts().unwrap();
    assert_eq!(counts.libraries, 0);
    assert_eq!(counts.directories, 0);
    assert_eq!(counts.files, 0);
    assert_eq!(counts.tracks, 0);
}

#[test]
fn test_scan_named_library() {
    let h = Harness::new();
    h.add_track("song.flac", &[("title", "Song")]);

    let scanner = h.scanner();
    let cancel = CancellationToken::new();

    let missing = scanner.scan(&ScanRequest::default().library("Other"), &cancel, None);
    assert!(matches!(missing, Err(ScanError::LibraryNotFound(_))));

    let summary = scanner
        .scan(&ScanRequest::default().library("Music"), &cancel, None)
        .unwrap();
    assert_eq!(summary.files_added, 1);
}

#[test]
fn test_cancelled_scan_commits_nothing_for_the_current_directory() {
    let h = Harness::new();
    h.add_track("song.flac", &[("title", "Song")]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = h.scanner().scan(&ScanRequest::default(), &cancel, None);

    assert!(matches!(result, Err(ScanError::Cancelled)));
    assert!(catalog(&h).file_paths(h.library.id).unwrap().is_empty());

    h.scan();
    assert_eq!(
        catalog(&h).file_paths(h.library.id).unwrap(),
        vec![h.path("song.flac")]
    );
}

#[test]
fn test_content_modified_moves_only_when_the_tree_changes() {
    let h = Harness::new();
    h.write("notes.txt", "not audio");
    h.add_track("song.flac", &[("title", "Song")]);
    h.scan();
    let stamp = content_modified(&h);
    assert!(stamp.is_some());

    let summary = h.scan();
    assert_eq!(summary.files_failed, 1);
    assert_eq!(content_modified(&h), stamp);

    let forced = h
        .scanner()
        .scan(&ScanRequest::new(true), &CancellationToken::new(), None)
        .unwrap();
    assert_eq!(forced.files_updated, 1);
    assert_eq!(content_modified(&h), stamp);

    h.add_track("other.flac", &[("title", "Other")]);
    h.scan();
    assert!(content_modified(&h) > stamp);
}

#[test]
fn test_rejected_directory_does_not_stop_its_siblings() {
    let h = Harness::new();
    h.add_track("A/a.flac", &[("title", "A")]);
    h.add_track("Rejected/r.flac", &[("title", "R")]);
    h.add_track("Z/z.flac", &[("title", "Z")]);
    execute(
        &h,
        "CREATE TRIGGER reject_directory BEFORE INSERT ON directories \
         WHEN NEW.path LIKE '%/Rejected' BEGIN SELECT RAISE(ABORT, 'rejected'); END",
    );

    let summary = h.scan();
    assert_eq!(summary.files_added, 2);
    assert_eq!(
        catalog(&h).file_paths(h.library.id).unwrap(),
        vec![h.path("A/a.flac"), h.path("Z/z.flac")]
    );
}

#[test]
fn test_failing_directory_is_removed_and_siblings_are_scanned() {
    let h = Harness::new();
    h.add_track("A/a.flac", &[("title", "A")]);
    h.add_track("M/broken.flac", &[("title", "Broken")]);
    h.add_track("Z/z.flac", &[("title", "Z")]);
    execute(
        &h,
        "CREATE TRIGGER reject_file BEFORE INSERT ON files \
         WHEN NEW.name = 'broken.flac' BEGIN SELECT RAISE(ABORT, 'rejected'); END",
    );

    let summary = h.scan();
    assert_eq!(summary.files_added, 2);
    assert_eq!(summary.directories_removed, 1);

    let id = h.library.id;
    assert_eq!(
        catalog(&h).file_paths(id).unwrap(),
        vec![h.path("A/a.flac"), h.path("Z/z.flac")]
    );
    assert_eq!(
        catalog(&h).directory_paths(id).unwrap(),
        vec![h.music.path().to_path_buf(), h.path("A"), h.path("Z")]
    );

    execute(&h, "DROP TRIGGER reject_file");
    let summary = h.scan();
    assert_eq!(summary.directories_added, 1);
    assert_eq!(summary.files_added, 1);
}

#[test]
fn test_vanished_stream_removes_its_track() {
    let h = Harness::new();
    let stream = |index: i32, artist: &str, album: &str, title: &str| {
        json!({"index": index, "codec_type": "audio", "codec_name": "opus",
               "tags": {"artist": artist, "album": album, "title": title}})
    };
    let path = h.write("both.mka", "two streams");
    h.tools.report(
        "both.mka",
        json!({
            "format": {"format_name": "matroska,webm", "duration": "60", "bit_rate": "128000"},
            "streams": [stream(0, "Low", "Things", "Main"), stream(1, "Guest", "Extra", "Commentary")]
        }),
    );
    let first = h.scan();
    assert_eq!(first.tracks_added, 2);

    fs::write(&path, "one stream left").unwrap();
    h.tools.report(
        "both.mka",
        json!({
            "format": {"format_name": "matroska,webm", "duration": "60", "bit_rate": "128000"},
            "streams": [stream(0, "Low", "Things", "Main")]
        }),
    );
    let summary = h.scan();
    assert_eq!(summary.tracks_removed, 1);
    assert_eq!(summary.tracks_updated, 0);
    assert_eq!(summary.artists_fixed, 2);
    assert_eq!(summary.albums_fixed, 2);

    let repo = catalog(&h);
    let tracks = repo.tracks().unwrap();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].stream_index, 0);
    assert_eq!(tracks[0].title, "Main");

    let extra = &repo.find_albums_by_title("Extra").unwrap()[0];
    assert!(!extra.dirty);
    assert!(!repo.find_artist_by_name("Guest").unwrap().unwrap().dirty);
}

#[test]
fn test_failed_cover_digest_removes_the_file() {
    let h = Harness::new();
    for name in ["art.flac", "broken.flac"] {
        h.write(name, name);
        h.tools.report(name, audio_with_cover(json!({"title": name})));
    }
    h.tools.fail_digest("broken.flac");

    let first = h.scan();
    assert_eq!(first.files_added, 1);
    assert_eq!(first.files_failed, 1);
    assert_eq!(catalog(&h).file_paths(h.library.id).unwrap(), vec![h.path("art.flac")]);
    assert_eq!(catalog(&h).counts().unwrap().pictures, 1);

    fs::write(h.path("art.flac"), "retagged art").unwrap();
    h.tools.fail_digest("art.flac");
    let second = h.scan();
    assert_eq!(second.files_failed, 2);

    let counts = catalog(&h).counts().unwrap();
    assert_eq!(counts.files, 0);
    assert_eq!(counts.tracks, 0);
    assert_eq!(counts.pictures, 0);
}

#[test]
fn test_packets_fill_in_missing_duration_and_bit_rate() {
    let h = Harness::new();
    h.write("raw.aac", "adts");
    h.tools.report(
        "raw.aac",
        json!({
            "format": {"format_name": "aac", "tags": {"title": "Raw"}},
            "streams": [{"index": 0, "codec_type": "audio", "codec_name": "aac"}],
            "packets": [
                {"stream_index": 0, "size": "2500", "duration_time": "2.500000"},
                {"stream_index": 0, "size": 2500, "duration_time": 2.5},
                {"stream_index": 1, "size": 9999, "duration_time": 1.0}
            ]
        }),
    );

    let summary = h.scan();
    assert_eq!(summary.tracks_added, 1);
    assert_eq!(h.tools.probe_count(), 2);

    let track = &catalog(&h).tracks().unwrap()[0];
    assert_eq!(track.duration, Some(5.0));
    assert_eq!(track.bit_rate, Some(8000));
}
