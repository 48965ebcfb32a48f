pub mod admission;
pub mod config;
pub mod keystore;
pub mod monitor;
pub mod repositories;
pub mod storage;
pub mod synthesizer;
