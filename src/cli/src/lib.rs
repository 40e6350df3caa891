//! A3S Rebase CLI - move container images onto a new base without rebuilding.

pub mod commands;
