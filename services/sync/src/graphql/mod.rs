pub mod client;
pub mod queries;
pub mod retry;
