pub mod file;
pub mod paths;
pub mod platform;
pub mod hash;
