pub mod broker;
pub mod codec;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod processor;
pub mod router;
pub mod wal;
