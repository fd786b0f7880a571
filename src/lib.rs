pub mod admin;
pub mod api;
pub mod auth;
pub mod config;
pub mod control;
pub mod db;
pub mod docker;
pub mod error;
pub mod health;
pub mod persist;
pub mod supervisor;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;
