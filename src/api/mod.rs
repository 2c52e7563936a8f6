pub mod dto;
pub mod handlers;

pub use handlers::{create_api_routes, SharedAppState};
