pub mod cli;
pub mod dataset;
pub mod error;
pub mod model;
pub mod setup;
pub mod train;
pub mod utils;
