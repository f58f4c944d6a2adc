//! Shared configuration, error, domain types and collaborator traits.

pub mod config;
pub mod db;
pub mod error;
pub mod traits;
pub mod types;
