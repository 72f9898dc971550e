//! Utility modules

pub mod keyed_lock;
