//! Portable, exact attention.
//!
//! This path favours clarity over absolute performance and serves as the
//! baseline for validating the fast kernels and as the per-call fallback.

pub mod exact;

pub use exact::ReferenceAttention;
