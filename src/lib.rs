pub mod api;
pub mod bootstrap;
pub mod chain;
pub mod config;
pub mod error;
pub mod ledger;
pub mod reconcile;
pub mod server;
pub mod settlement;
pub mod sync;

#[cfg(test)]
pub mod test_utils;
