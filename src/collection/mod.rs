pub mod changeset;
pub mod config;
pub mod describe;
