pub mod constants;
pub mod dice;
pub mod error;
pub mod state;
