//! octomon — GitHub webhook gateway and worker services.
//!
//! Four services share this library:
//! - **gateway**: public ingress; verifies webhook signatures and routes
//!   events to the workers, aggregates their dashboards behind basic auth.
//! - **pr-reviewer**: turns `pull_request` events into queued review tasks,
//!   runs the AI CLI over the diff, posts the review as a PR comment.
//! - **issue-copier**: replicates issues from a source repository to target
//!   repositories by label, mirrors comments, re-hosts images.
//! - **issue-scorer**: scores issues/comments on four dimensions and learns
//!   from user feedback to calibrate future scoring prompts.

pub mod agent;
pub mod config;
pub mod copier;
pub mod gateway;
pub mod github;
pub mod pool;
pub mod reviewer;
pub mod scorer;
pub mod store;
pub mod util;
pub mod webhook;

pub use config::Config;
pub use store::Store;
