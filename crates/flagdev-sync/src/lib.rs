//! flagdev sync - upstream adapters and project orchestration.

pub mod export;
pub mod projects;
pub mod protocol;
pub mod remote;

pub use export::{ExportedOverride, ProjectExport};
pub use projects::{ProjectService, SyncStats};
pub use protocol::{Environment, RemoteFlag};
pub use remote::{EvaluationSdk, HttpEvaluationSdk, HttpManagementApi, ManagementApi};

#[cfg(any(test, feature = "test-utils"))]
pub use remote::mock::{StaticEvaluationSdk, StaticManagementApi};
