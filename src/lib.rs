#![forbid(unsafe_code)]

pub mod admission;
pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod formats;
pub mod glossary;
pub mod ledger;
pub mod logging;
pub mod openai;
pub mod orchestrator;
pub mod stages;
pub mod store;
pub mod structured;
pub mod transcribe;
