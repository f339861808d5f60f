pub mod api;
pub mod cache;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod controllers;
pub mod deployutil;
pub mod error;
pub mod events;
pub mod images;
pub mod instantiate;
pub mod models;
pub mod retry;
pub mod rollback;
pub mod storage;
pub mod triggers;
pub mod workqueue;

#[cfg(test)]
mod testutil;

pub use storage::Storage;
