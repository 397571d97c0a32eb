//! Operator API: health, dead-letter inspection, backlog counts and re-drive.

pub mod middleware;
pub mod routes;
pub mod state;
