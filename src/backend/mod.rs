//! Adapters that connect the pipeline to the outside world.
//! - `dimse` receives instances over DIMSE (STORE-SCP) and hands them to the dispatch guard.
//! - `filesystem` and `cleanup` manage the temporary copies of received instances.
//! - `sqlite` keeps payloads that are not delivered yet.
//! - `s3` and `broker` deliver payloads.

pub mod broker;
pub mod cleanup;
pub mod dimse;
pub mod filesystem;
pub mod s3;
pub mod sqlite;
