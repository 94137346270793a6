pub mod advisory;
pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod policy;
pub mod server;
pub mod ws;
