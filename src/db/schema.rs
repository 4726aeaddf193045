//! Database schema definitions for Diesel.

diesel::table! {
    libraries (id) {
        id -> Integer,
        name -> Text,
        path -> Text,
        restricted -> Bool,
        content_modified -> Nullable<Timestamp>,
        created_at -> Timestamp,
    }
}

diesel::table! {
    directories (id) {
        id -> Integer,
        library_id -> Integer,
        parent_id -> Nullable<Integer>,
        path -> Text,
        added -> Timestamp,
    }
}

diesel::table! {
    files (id) {
        id -> Integer,
        library_id -> Integer,
        directory_id -> Integer,
        name -> Text,
        size -> BigInt,
        modified -> BigInt,
        format_name -> Nullable<Text>,
        added -> Timestamp,
    }
}

diesel::table! {
    pictures (id) {
        id -> Integer,
        file_id -> Integer,
        stream_index -> Integer,
        digest -> BigInt,
    }
}

diesel::table! {
    artists (id) {
        id -> Integer,
        name -> Nullable<Text>,
        sort_name -> Nullable<Text>,
        added -> Timestamp,
        dirty -> Bool,
    }
}

diesel::table! {
    albums (id) {
        id -> Integer,
        artist_id -> Nullable<Integer>,
        picture_id -> Nullable<Integer>,
        genre_id -> Nullable<Integer>,
        date -> Nullable<Integer>,
        original_date -> Nullable<Integer>,
        title -> Nullable<Text>,
        sort_title -> Nullable<Text>,
        added -> Timestamp,
        dirty -> Bool,
    }
}

diesel::table! {
    genres (id) {
        id -> Integer,
        name -> Text,
    }
}

diesel::table! {
    tracks (id) {
        id -> Integer,
        file_id -> Integer,
        stream_index -> Integer,
        codec -> Text,
        bit_rate -> Nullable<Integer>,
        duration -> Nullable<Double>,
        artist_id -> Integer,
        album_id -> Integer,
        genre_id -> Nullable<Integer>,
        picture_id -> Nullable<Integer>,
        disc_number -> Nullable<Integer>,
        track_number -> Nullable<Integer>,
        title -> Text,
        sort_title -> Nullable<Text>,
        artist_sort -> Nullable<Text>,
        album_artist_sort -> Nullable<Text>,
        album_sort -> Nullable<Text>,
        date -> Nullable<Integer>,
        original_date -> Nullable<Integer>,
        album_gain -> Nullable<Double>,
        track_gain -> Nullable<Double>,
    }
}

diesel::table! {
    track_genres (track_id, genre_id) {
        track_id -> Integer,
        genre_id -> Integer,
    }
}

// Define foreign key relationships
diesel::joinable!(directories -> libraries (library_id));
diesel::joinable!(files -> directories (directory_id));
diesel::joinable!(pictures -> files (file_id));
diesel::joinable!(albums -> artists (artist_id));
diesel::joinable!(tracks -> files (file_id));
diesel::joinable!(tracks -> albums (album_id));
diesel::joinable!(tracks -> artists (artist_id));
diesel::joinable!(tracks -> pictures (picture_id));
diesel::joinable!(track_genres -> tracks (track_id));
diesel::joinable!(track_genres -> genres (genre_id));

diesel::allow_tables_to_appear_in_same_query!(
    libraries,
    directories,
    files,
    pictures,
    artists,
    albums,
    genres,
    tracks,
    track_genres,
);
