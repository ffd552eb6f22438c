#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! brewlink library — the BrewOS cloud relay's building blocks.
//!
//! - `relay` — device WebSocket registry, frame decoding, event publication
//! - `proxy` — client sessions, fan-out, offline queue, state cache
//! - `store` — credential/ownership store trait and HTTP implementation
//! - `auth` — admin key authentication middleware
//! - `config` — configuration loading
//! - `routes` — REST route handlers

pub mod auth;
pub mod config;
pub mod proxy;
pub mod relay;
pub mod routes;
pub mod state;
pub mod store;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use proxy::ClientProxy;
pub use relay::DeviceRelay;
pub use state::AppState;
pub use store::{CredentialStore, HttpCredentialStore};
