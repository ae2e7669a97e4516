//! API clients for external services
//!
//! - YTS: movie catalog search with torrent variants

pub mod yts;

pub use yts::YtsClient;
