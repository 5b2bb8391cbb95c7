//! vmpull CLI - pull VM images from OCI registries.

pub mod commands;
pub mod output;
