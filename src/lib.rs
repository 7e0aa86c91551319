//! Site opening workflow engine
//!
//! A proposed location (ULOK) is approved, followed by its KPLT, whose
//! approval opens a six stage pipeline that ends with the store's grand
//! opening. [`service::WorkflowOrchestrator`] is the entry point.
pub mod authority;
pub mod case;
pub mod config;
pub mod documents;
pub mod error;
pub mod ledger;
pub mod service;
pub mod stage;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utils;
pub mod view;
