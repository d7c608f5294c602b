pub mod chat;
pub mod error;
pub mod events;
pub mod media;
pub mod models;
pub mod payload;
pub mod session;
pub mod transcript;

pub use error::AnalyzeError;
