//! Music library catalog: scans directory trees of audio files with external
//! probe tools and reconciles them into a relational catalog.

pub mod config;
pub mod db;
pub mod models;
pub mod scanner;
