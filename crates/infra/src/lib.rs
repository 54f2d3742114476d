//! Infrastructure layer: stores, task queue, provider clients, lifecycle wiring.
//!
//! Every store has an in-memory implementation (dev/tests) and a Postgres one;
//! callers depend on the traits only.

pub mod config;
pub mod db;
pub mod external;
pub mod ledger;
pub mod lifecycle;
pub mod predictions;
pub mod schema;
pub mod tasks;
pub mod works;
