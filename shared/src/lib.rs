pub mod payload;
pub mod protocol;
pub mod types;
