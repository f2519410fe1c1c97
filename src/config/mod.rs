pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{load_snapshot, load_snapshot_sync};
pub use models::*;
pub use validation::{
    AppConfigValidator, RouteDocumentValidator, ServerPoolValidator, ValidationError,
    ValidationResult,
};
