//! Domain model module declarations.

pub mod convoy;
pub mod tier;
pub mod worker;
