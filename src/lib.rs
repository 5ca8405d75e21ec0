pub mod cli;
pub mod utils;

pub use hilti_runtime as runtime;
