pub mod cli;
pub mod config;
pub mod data_source;
pub mod dialog;
pub mod error;
pub mod reporter;
pub mod scenario;
pub mod scheduler;
pub mod shutdown;
pub mod sip;
pub mod stats;
pub mod testutil;
pub mod transport;
