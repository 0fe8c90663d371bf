pub mod api;
pub mod grbl;
