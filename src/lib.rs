//! Plugin Host Harness
//!
//! Lets a browser-driven test impersonate the host application that embeds
//! a plugin in an iframe. Backend and data requests are answered from a
//! mock table and the host handshake is emulated over a dedicated
//! message channel.
//!
//! # Features
//!
//! - **Route Mocks**: Ordered mocks per method and URL, first match wins
//! - **Fallbacks**: Matcher-less mocks answer when nothing specific does
//! - **One-shot Mocks**: Consumed on first use
//! - **Streaming**: Event-stream bodies for completion endpoints
//! - **Failure Injection**: Abort requests with network error categories
//! - **Host Handshake**: Distinct `window.parent`, init event and channel
//! - **Auto-responders**: Answer plugin requests by topic
//!
//! # Example Configuration
//!
//! ```yaml
//! plugin_id: plugin123
//! origins:
//!   backend: http://localhost:8787
//!   data: http://localhost:54321
//! mocks:
//!   - id: lookup
//!     method: POST
//!     path: /api/llm
//!     matcher:
//!       - type: instructions_contains
//!         value: lookup
//!     response:
//!       definition: "a house"
//!   - id: words
//!     method: GET
//!     origin: data
//!     path: /rest/v1/words
//!     response: []
//! ```

pub mod channel;
pub mod config;
pub mod driver;
pub mod engine;
pub mod environment;
pub mod error;
pub mod matcher;
pub mod registry;
pub mod request;
pub mod settings;
pub mod stream;
pub mod template;
pub mod testing;

pub use channel::MessageChannelSimulator;
pub use config::HarnessConfig;
pub use driver::{PageDriver, RouteDisposition};
pub use engine::MockResolutionEngine;
pub use environment::TestEnvironment;
pub use error::{HarnessError, Result};
pub use matcher::MockMatcher;
pub use registry::{MockOptions, MockRecord, MockValue};
pub use request::{HttpMethod, InterceptedRequest, RequestView};
