pub mod client;
pub mod config;
pub mod digest;
pub mod logging;

pub mod election;
pub mod job;
pub mod master;
pub mod media;
pub mod node;
pub mod registry;
pub mod retry;
pub mod sanitize;
pub mod scorer;
pub mod server;
pub mod storage;
pub mod wire;
pub mod worker;
