//! Models for the music catalog.

pub mod catalog;

pub use catalog::*;
