//! Library crate for playbymail-back, exposing modules for binaries and integration tests.

pub mod config;
pub mod dao;
pub mod dto;
pub mod error;
pub mod games;
pub mod routes;
pub mod services;
pub mod sheets;
pub mod state;
pub mod transport;
