//! Integration tests for dirsync-remote
//!
//! Uses wiremock to simulate the store's HTTP service endpoint and verifies
//! request shapes, status-code classification, session logon and streamed
//! content in both directions.

mod common;

mod test_service_calls;
mod test_session;
mod test_streams;
