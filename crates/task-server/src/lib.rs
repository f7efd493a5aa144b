//! HTTP surface and `CapturePipeline` orchestration for the capture-to-plan
//! control plane (spec.md §6): a `state` module for the shared `AppState`,
//! an `http` module for the axum `Router` and `serve` entry point, and a
//! local `error` module bridging the domain error type into
//! `axum::response::IntoResponse`.

pub mod capture;
pub mod error;
pub mod http;
pub mod state;

pub use capture::{CapturePipeline, CaptureResult};
pub use error::ApiError;
pub use http::{app_router, serve};
pub use state::AppState;
