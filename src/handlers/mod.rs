pub mod artifacts;
pub mod ask;
pub mod config;
pub mod sessions;

pub use artifacts::*;
pub use ask::*;
pub use config::*;
pub use sessions::*;
