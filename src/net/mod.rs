//! Shared networking infrastructure.

pub mod client;
pub mod rechunk;

pub use client::{HttpClient, HttpClientBuilder};
pub use rechunk::Rechunk;
