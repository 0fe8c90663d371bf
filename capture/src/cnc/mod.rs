pub mod connection;
pub mod grbl;
