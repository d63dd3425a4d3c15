pub mod custom;
pub mod keys;
pub mod resolver;

pub use keys::{extract_keys, select_key};
pub use resolver::{pick_target, resolve};
