//! Route handlers

pub mod alerts;
pub mod rules;
