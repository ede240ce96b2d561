//! End-to-end test infrastructure for Stagehand.
//!
//! Runs real pipelines against throwaway workspaces with the host shell
//! runner, so no external services are needed.
//!
//! # Usage
//!
//! ```ignore
//! use stagehand_tests::{TestWorkspace, fixtures};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ws = TestWorkspace::new();
//!     let result = ws.run(fixtures::LINT_AND_TEST, &fixtures::merge_request()).await.unwrap();
//! }
//! ```

pub mod fixtures;
pub mod helpers;

pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,stagehand_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}
