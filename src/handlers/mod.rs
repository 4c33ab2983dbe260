pub mod commands;
pub mod villa;
