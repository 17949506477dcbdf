pub mod collector;
pub mod launcher;
