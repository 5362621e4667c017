pub mod auth;
pub mod device;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod site;
pub mod sql;
pub mod sweeper;
pub mod tls;
pub mod wal;
pub mod wire;
