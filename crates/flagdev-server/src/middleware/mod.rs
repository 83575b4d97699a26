pub mod cors;
pub mod project_key;

pub use cors::cors_layer;
pub use project_key::{resolve_env_id, resolve_sdk_key, ProjectKey};
