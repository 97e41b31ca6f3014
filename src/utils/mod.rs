pub mod dom;
pub mod error;

pub use error::{AppError, Result};
