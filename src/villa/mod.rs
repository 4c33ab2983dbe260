pub mod catalog;
pub mod error;
pub mod flow;
pub mod machine;
pub mod prompt;
pub mod session;
