//! HTTP surface: the guard pipeline as axum middleware, rejections, and the server.

mod pipeline;
mod rejection;
mod server;

pub use pipeline::{PipelineBuilder, RequestPipeline, X_REQUEST_ID};
pub use rejection::{Rejection, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING};
pub use server::HttpServer;
