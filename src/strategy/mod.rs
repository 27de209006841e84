pub mod accounting;
pub mod engine;
pub mod risk;
pub mod trend;
