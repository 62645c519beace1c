pub mod cli;
pub mod history;
pub mod message_tracing;
pub mod models;
pub mod providers;
pub mod quota;
pub mod session;
