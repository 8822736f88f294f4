//! tollgate: an OpenAI-compatible metering proxy in front of a local Ollama
//! backend. Requests are authenticated per user, admitted through sliding
//! rate-limit windows, forwarded (buffered or streaming), and every completed
//! request is priced and recorded.

pub mod auth;
pub mod backend;
pub mod config;
pub mod counters;
pub mod error;
pub mod http;
pub mod limiter;
pub mod multipart;
pub mod pricing;
pub mod store;
pub mod tracker;
pub mod types;

pub use config::{DefaultLimits, Env, Settings};
pub use error::ProxyError;
pub use http::{router, AppState};
pub use store::Store;
