pub mod controller;
pub mod messages;
pub mod parser;
