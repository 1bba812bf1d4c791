//! # murmur-store
//!
//! Durable storage for the Murmur relay, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for users, access
//! tokens, two-party rooms and their append-only message log. Message
//! contents are stored exactly as the clients encrypted them.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod rooms;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
