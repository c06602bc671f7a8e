pub mod sandbox;
pub mod utils;
