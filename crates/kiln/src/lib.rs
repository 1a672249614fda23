pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod file_tree;
pub mod hash_cache;
pub mod logging;
pub mod modules;
pub mod planner;
pub mod raster;
pub mod vcs;
pub mod workspace;

pub use error::{Error, Result};
