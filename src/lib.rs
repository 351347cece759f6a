// src/lib.rs

//! Package usage harvester library

pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod throttle;
pub mod utils;
