//! # Models
//!
//! Dose-response model implementations. Currently the hierarchical hormesis
//! model with reversible-jump selection of the low-dose bump.

pub mod hormesis;
