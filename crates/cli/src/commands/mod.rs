//! CLI Commands

pub mod keys;
pub mod membership;
pub mod nodes;
pub mod peers;
