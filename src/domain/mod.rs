//! Domain types: analyzer categories, issues, the website snapshot,
//! typed metrics and progress events.

pub mod metrics;
pub mod models;
pub mod snapshot;

pub use metrics::*;
pub use models::*;
