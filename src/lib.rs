#![forbid(unsafe_code)]

//! Library side of the `regionfree` downloader: fetch one YouTube video or
//! short through a local tor proxy, then transcode it under a portable name.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod pipeline;
pub mod sanitize;
pub mod shutdown;
pub mod tools;
pub mod tor;
pub mod transcode;
pub mod video_url;

#[cfg(test)]
pub(crate) mod test_support;
