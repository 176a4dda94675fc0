//! dirsync Remote - adapters for the remote store port
//!
//! Provides:
//! - [`http::HttpTransport`] - JSON-over-HTTP transport with token or
//!   user/password sessions and streamed content
//! - [`memory::InMemoryStore`] - a complete in-process store used by tests
//!   and dry runs
//!
//! ## Wire contract
//!
//! Every service takes a JSON object of arguments and answers with a JSON
//! object. Content-bearing calls stream raw bytes alongside.
//!
//! | service                | arguments                                   | result                        |
//! |------------------------|---------------------------------------------|-------------------------------|
//! | `namespace.exists`     | `{path}`                                    | `{exists}`                    |
//! | `namespace.create`     | `{path}`                                    | `{}`                          |
//! | `asset.exists`         | `{paths: [..]}`                             | `{exists: [..]}`              |
//! | `asset.get`            | `{paths: [..]}` or `{path}` + content       | `{assets: [..]}` / `{asset}`  |
//! | `asset.create`         | `{path, auto_create_namespace, posix}` + content | `{asset}`                |
//! | `asset.set`            | `{id, posix}` + content                     | `{asset}`                     |
//! | `asset.soft.destroy`   | `{paths: [..]}` or `{namespace}`            | `{count}`                     |
//! | `asset.soft.undestroy` | `{ids: [..]}`                               | `{count}`                     |
//! | `asset.query`          | `{namespace, idx, size}`                    | `{assets, cursor}`            |
//! | `server.ping`          | `{}`                                        | `{}`                          |
//! | `mail.send`            | `{from, to, subject, body}`                 | `{}`                          |

pub mod http;
pub mod memory;

pub use http::HttpTransport;
pub use memory::InMemoryStore;
