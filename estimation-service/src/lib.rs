//! Estimation Service - versioned project estimations, vendor purchase requests,
//! quantity allocation and the project payment ledger.

pub mod config;
pub mod error;
pub mod models;
pub mod pricing;
pub mod services;
pub mod startup;
