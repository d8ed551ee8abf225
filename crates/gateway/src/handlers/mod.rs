//! API handlers module

pub mod health;
pub mod lifecycle;
pub mod query;
pub mod recall;
pub mod sessions;
