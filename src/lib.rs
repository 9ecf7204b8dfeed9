pub mod config;
pub mod error;
pub mod http;
pub mod terminal;
pub mod tools;
pub mod utils;
