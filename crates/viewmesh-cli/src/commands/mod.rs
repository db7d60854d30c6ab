//! Subcommand implementations

pub mod finality;
pub mod keygen;
pub mod node;
pub mod view;
