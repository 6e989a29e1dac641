#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

pub mod accounts;
pub mod adapter;
pub mod chunker;
pub mod config;
pub mod error;
pub mod host;
pub mod inbound;
pub mod outbound;
pub mod pairing;
pub mod provider;
pub mod status;
pub mod supervisor;
pub(crate) mod util;

pub use adapter::LinqAdapter;
pub use config::{LinqAccountConfig, LinqChannelConfig};
pub use error::{BridgeError, Result};
