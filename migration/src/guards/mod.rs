//! Constraints that sea-query cannot express, organized by migration.
//!
//! Each migration that defines such constraints has a submodule here
//! containing the raw SQL for the supported backends.

pub mod m20261016_000001_init;
