#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

mod client;
mod config;
mod consumers;
mod error_counters;
mod errors;
mod hub;
mod instance;
mod logger;
mod requests;
mod types;
mod util;

pub use self::{
    client::ApitallyClient,
    config::{
        ApitallyConfig, ExcludeCallback, MaskRequestBodyCallback, MaskResponseBodyCallback,
        RequestLoggingConfig,
    },
    consumers::Consumer,
    errors::ApitallyError,
    types::{ExceptionInfo, LogRecord, PathInfo, Request, Response},
    util::parse_content_length,
};
