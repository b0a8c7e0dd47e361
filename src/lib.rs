pub mod config;
pub mod epub;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod sentinels;
pub mod textutil;
