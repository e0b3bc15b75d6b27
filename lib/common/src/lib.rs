mod collection;
mod error;
mod handler;

pub use collection::*;
pub use error::*;
pub use handler::*;
