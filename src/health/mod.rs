//! Folder health monitor (L15).

pub mod folder;
