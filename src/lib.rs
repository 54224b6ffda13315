// Library exports for the toolfleet process supervisor

pub mod config;
pub mod error;
pub mod poll;
pub mod process;
pub mod registry;
