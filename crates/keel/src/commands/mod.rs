pub mod build;
pub mod service;
