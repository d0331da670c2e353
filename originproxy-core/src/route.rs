//! Exact-match hostname routing table, built once at startup and shared
//! read-only across every connection.

use std::collections::HashMap;

use originproxy_config::{Config, Route as RouteConfig};

use crate::host::normalize_host;

/// An immutable per-domain routing entry. Field names mirror
/// `originproxy_config::Route` but this is the runtime-normalized shape:
/// `domain` is guaranteed lowercase with no port suffix, matching what
/// [`RouteTable::lookup`] compares a sniffed host against.
#[derive(Debug, Clone)]
pub struct Route {
    pub domain: String,
    pub target: String,
    pub force_tls: bool,
    pub header_forwarded_for: bool,
    pub stream: bool,
    pub replaces: Vec<Replace>,
}

#[derive(Debug, Clone)]
pub struct Replace {
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

impl From<&RouteConfig> for Route {
    fn from(r: &RouteConfig) -> Self {
        Route {
            domain: normalize_host(&r.domain),
            target: r.target.clone(),
            force_tls: r.http.force_tls,
            header_forwarded_for: r.http.header_forwarded_for,
            stream: r.stream,
            replaces: r
                .replaces
                .iter()
                .map(|rep| Replace {
                    old: rep.old.clone().into_bytes(),
                    new: rep.new.clone().into_bytes(),
                })
                .collect(),
        }
    }
}

/// Domain → Route, built once from `Config` and looked up once per
/// connection. Misses are a terminal error for that connection.
pub struct RouteTable {
    routes: HashMap<String, Route>,
}

impl RouteTable {
    pub fn from_config(config: &Config) -> Self {
        let routes = config
            .routes
            .iter()
            .map(|r| {
                let route = Route::from(r);
                (route.domain.clone(), route)
            })
            .collect();
        Self { routes }
    }

    /// Looks up `host` (which may carry a `:port` suffix and arbitrary
    /// case) against the table, after the same normalization used to build
    /// it.
    pub fn lookup(&self, host: &str) -> Option<&Route> {
        self.routes.get(&normalize_host(host))
    }

    /// The set of domains this table serves, used to drive the ACME
    /// certificate resolver's host policy.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}
