//! dchyper: the HYPER transfer engine for Direct Connect peers.
//!
//! - [`hyper`]: wire codec, connections, client and server sessions
//! - [`storage`]: where served bytes come from
//! - [`config`]: tuning knobs, loadable from TOML

pub mod config;
pub mod error;
pub mod hyper;
pub mod storage;

pub use config::{HyperConfig, Role};
pub use error::{HyperError, Result};
