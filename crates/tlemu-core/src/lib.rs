pub mod config;
pub mod error;
pub mod handle_map;
