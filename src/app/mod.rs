pub mod browser;
pub mod cli;
