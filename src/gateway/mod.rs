pub mod link;
pub mod server;
pub mod session;
pub mod transaction;
pub mod worker;
