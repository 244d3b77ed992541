pub mod core;
pub mod document;
