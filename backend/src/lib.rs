pub mod config;
pub mod error;
pub mod ingest;
pub mod job_controller;
pub mod services;
pub mod storage;
