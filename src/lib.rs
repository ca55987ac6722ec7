pub mod analytics;
pub mod catalog;
pub mod client;
pub mod config;
pub mod jobs;
pub mod models;
pub mod resolver;
pub mod storage;
