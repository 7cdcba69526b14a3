pub mod connection;
pub mod connector;
pub mod pool;
