//! `[serve]` section configuration.
//!
//! The query API that annotation front ends poll during `pagesync watch`:
//! status, lookups, coordinate conversion, reload signals and the page
//! artifacts themselves.

use super::defaults;
use educe::Educe;
use serde::{Deserialize, Serialize};
use std::net::{AddrParseError, IpAddr};

/// `[serve]` section in pagesync.toml.
///
/// # Example
/// ```toml
/// [serve]
/// interface = "127.0.0.1"
/// port = 5278
/// allow_origin = "http://localhost:5173"  # the canvas app
/// watch = true                            # rebuild when sources change
/// ```
#[derive(Debug, Clone, Educe, Serialize, Deserialize)]
#[educe(Default)]
#[serde(deny_unknown_fields)]
pub struct ServeConfig {
    /// Address the query API listens on. Keep it on loopback unless the
    /// canvas runs on another machine.
    #[serde(default = "defaults::serve::interface")]
    #[educe(Default = defaults::serve::interface())]
    pub interface: String,

    /// First port tried; the next free one is used when it is taken.
    #[serde(default = "defaults::serve::port")]
    #[educe(Default = defaults::serve::port())]
    pub port: u16,

    /// `Access-Control-Allow-Origin` sent with API responses.
    #[serde(default = "defaults::serve::allow_origin")]
    #[educe(Default = defaults::serve::allow_origin())]
    pub allow_origin: String,

    /// Feed source changes to the build scheduler. Without it documents are
    /// built once at startup.
    #[serde(default = "defaults::r#true")]
    #[educe(Default = true)]
    pub watch: bool,
}

impl ServeConfig {
    pub fn interface_addr(&self) -> Result<IpAddr, AddrParseError> {
        self.interface.parse()
    }
}
