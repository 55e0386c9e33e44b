// src/lib.rs

//! Link event aggregation and archival library

pub mod aggregate;
pub mod db;
pub mod error;
pub mod matcher;
pub mod models;
pub mod pipeline;
pub mod storage;
pub mod utils;
