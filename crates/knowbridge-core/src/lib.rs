//! # Knowbridge Core
//!
//! Runtime-free logic shared by the Knowbridge application: data models,
//! chunking, the search backend abstraction, the hybrid search algorithm,
//! and context budget selection.
//!
//! This crate contains no tokio, sqlx, HTTP clients, or filesystem I/O.
//! Everything that talks to the outside world lives in the `knowbridge`
//! app crate and plugs in through the traits defined here.

pub mod chunk;
pub mod context;
pub mod embedding;
pub mod error;
pub mod models;
pub mod search;
pub mod store;
