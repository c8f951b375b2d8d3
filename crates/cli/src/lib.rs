//! meshvpn CLI
//!
//! Command-line interface for admitting peers to the mesh and inspecting
//! its nodes and registry.

pub mod commands;
pub mod context;
pub mod output;
