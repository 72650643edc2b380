//! Network collaborator for fetching tile bytes.
//!
//! The engine depends only on the [`TileClient`] trait so that transports can
//! be swapped (and mocked in tests). [`ReqwestTileClient`] is the production
//! implementation.

mod http;
mod types;

pub use http::ReqwestTileClient;
pub use types::{TileClient, TransportError};

#[cfg(test)]
pub use http::tests::{MockResponse, MockTileClient};
