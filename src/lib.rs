pub mod api;
pub mod config;
pub mod memory_repo;
mod orm;
pub mod short_code;
pub mod url_repo;
pub mod url_service;
