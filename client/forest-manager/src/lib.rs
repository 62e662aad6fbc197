pub mod error;
pub mod in_memory;
pub(crate) mod prove;
pub mod traits;
pub mod types;

#[cfg(test)]
mod test_utils;

const LOG_TARGET: &str = "forest-storage";
