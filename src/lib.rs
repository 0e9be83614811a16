pub mod build;
pub mod config;
pub mod core;
pub mod guid;
pub mod import;
pub mod persistence;
pub mod source;
pub mod tags;

pub use crate::core::DecksmithError;
