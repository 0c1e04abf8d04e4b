//! CLI command implementations

pub mod build;
pub mod init;
pub mod list;

pub use build::execute as build;
pub use init::execute as init;
pub use list::execute as list;
