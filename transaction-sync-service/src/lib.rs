//! Transaction Sync Service - bank-feed ingestion, merchant matching, refund
//! association and reward network publishing.

pub mod config;
pub mod models;
pub mod reconciliation;
pub mod services;
pub mod startup;
pub mod workers;
