pub mod config;
pub mod redis;
pub mod storage;
pub mod types;
