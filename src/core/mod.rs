pub mod errors;

pub use errors::DecksmithError;
