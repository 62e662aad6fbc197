pub mod in_memory;
pub mod traits;

const LOG_TARGET: &str = "file-storage";
