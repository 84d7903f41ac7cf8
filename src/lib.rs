// src/lib.rs

//! pkgpool - binary package repository maintenance
//!
//! Maintains a tree of eopkg repositories sharing one content pool.
//!
//! # Architecture
//!
//! - Pool: one physical copy per filename under `<base>/pool`, hardlinked into
//!   every repository that references it and removed once nothing does
//! - Repository databases: per-repository SQLite file mapping source names to
//!   the artifacts present in that repository
//! - Deltas: derived packages between releases, cached in the pool and shared
//!   between repositories
//! - Sessions: one command, one pass; altered repositories get their index
//!   rebuilt once at the end

pub mod config;
pub mod db;
pub mod delta;
mod error;
pub mod packages;
pub mod pool;
pub mod repository;

pub use config::Config;
pub use error::{Error, Result};
pub use repository::Session;
