//! Utilities shared by the Veil client crates and their embedders.

pub mod logging;
