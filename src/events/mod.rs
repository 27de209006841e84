pub mod bus;
pub mod publisher;
