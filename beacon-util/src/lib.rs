//! Helpers shared by every beacon crate: directories, atomic writes,
//! JSON config documents, URIs, secrets and key derivation.

pub mod config;
pub mod crypto;
pub mod dirs;
pub mod fs;
pub mod http;
pub mod json;
pub mod store;
pub mod types;
