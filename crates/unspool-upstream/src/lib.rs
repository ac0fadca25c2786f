#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![warn(missing_docs, unreachable_pub, unused)]
#![allow(clippy::module_name_repetitions)]

//! HTTP clients for the upstream download-queue applications.

pub mod client;
pub mod error;

pub use client::{StarrClient, api_version, id_keys};
pub use error::{UpstreamError, UpstreamResult};
