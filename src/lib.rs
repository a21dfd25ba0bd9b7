//! Decety: catalog matching backend for shop item variants and their images.

pub mod access;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod ids;
pub mod images;
pub mod metrics;
pub mod rate_limit;
pub mod server;
pub mod storage;
pub mod tokens;
pub mod types;
