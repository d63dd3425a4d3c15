pub mod markers;
pub mod pipeline;

pub use pipeline::{authenticate, is_public_endpoint};
