pub mod client;
pub mod detector;
pub mod shared_token;

pub use client::{OAuthClient, OAuthCredentials, OAuthStatus};
pub use shared_token::{SharedToken, SharedTokenStore};
