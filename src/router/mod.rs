mod config;
mod header_parser;
mod rule;
mod virtual_host;

pub use config::{
    HeaderMatchConfig, HeaderValueConfig, RetryPolicyConfig, RouteActionConfig, RouteConfig,
    RouteMatchConfig, RouterConfig, VirtualHostConfig, WeightedClusterConfig,
};
pub use header_parser::HeaderParser;
pub use rule::{RetryPolicy, RouteRule};
pub use virtual_host::VirtualHost;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::Header;
use crate::AppResult;

/// routing header keys synthesised by the proxy driver
pub const PATH_HEADER: &[u8] = b"path";
pub const AUTHORITY_HEADER: &[u8] = b"authority";
pub const HOST_HEADER: &[u8] = b"host";
pub const METHOD_HEADER: &[u8] = b"method";
pub const ORIGINAL_PATH_HEADER: &[u8] = b"x-forwarded-original-path";

/// The routing tree: virtual hosts indexed by domain. Exact domains win
/// over wildcard suffixes (longest first), which win over the `*`
/// default.
pub struct Routers {
    virtual_hosts: Vec<Arc<VirtualHost>>,
    exact: HashMap<String, usize>,
    /// `(suffix, index)` ordered by suffix length descending
    wildcard: Vec<(String, usize)>,
    default_vh: Option<usize>,
    global_request_parser: Arc<HeaderParser>,
    global_response_parser: Arc<HeaderParser>,
}

impl Routers {
    pub fn new(config: &RouterConfig) -> AppResult<Arc<Routers>> {
        let mut virtual_hosts = Vec::with_capacity(config.virtual_hosts.len());
        let mut exact = HashMap::new();
        let mut wildcard: Vec<(String, usize)> = Vec::new();
        let mut default_vh = None;

        for vh_config in &config.virtual_hosts {
            let idx = virtual_hosts.len();
            let vh = Arc::new(VirtualHost::new(vh_config)?);
            for domain in vh.domains() {
                if domain == "*" {
                    if default_vh.is_none() {
                        default_vh = Some(idx);
                    }
                } else if let Some(suffix) = domain.strip_prefix('*') {
                    wildcard.push((suffix.to_string(), idx));
                } else {
                    exact.entry(domain.clone()).or_insert(idx);
                }
            }
            virtual_hosts.push(vh);
        }
        wildcard.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Ok(Arc::new(Routers {
            virtual_hosts,
            exact,
            wildcard,
            default_vh,
            global_request_parser: Arc::new(HeaderParser::new(
                &config.request_headers_to_add,
                &config.request_headers_to_remove,
            )),
            global_response_parser: Arc::new(HeaderParser::new(
                &config.response_headers_to_add,
                &config.response_headers_to_remove,
            )),
        }))
    }

    fn find_virtual_host(&self, headers: &Header) -> Option<&Arc<VirtualHost>> {
        let authority = headers
            .get(AUTHORITY_HEADER)
            .or_else(|| headers.get(HOST_HEADER))
            .map(|a| String::from_utf8_lossy(a).to_ascii_lowercase())
            .unwrap_or_default();

        if let Some(idx) = self.exact.get(&authority) {
            return self.virtual_hosts.get(*idx);
        }
        for (suffix, idx) in &self.wildcard {
            if authority.ends_with(suffix.as_str()) {
                return self.virtual_hosts.get(*idx);
            }
        }
        self.default_vh.and_then(|idx| self.virtual_hosts.get(idx))
    }

    /// Match the request headers to a virtual host and its first
    /// matching rule.
    pub fn match_route(&self, headers: &Header) -> Option<MatchedRoute> {
        let vhost = self.find_virtual_host(headers)?.clone();
        let rule = vhost.match_route(headers)?;
        Some(MatchedRoute {
            rule,
            vhost,
            global_request_parser: self.global_request_parser.clone(),
            global_response_parser: self.global_response_parser.clone(),
        })
    }
}

/// One matched rule bundled with its enclosing scopes so the rewrite
/// pipeline can compose across levels.
pub struct MatchedRoute {
    rule: Arc<RouteRule>,
    vhost: Arc<VirtualHost>,
    global_request_parser: Arc<HeaderParser>,
    global_response_parser: Arc<HeaderParser>,
}

impl MatchedRoute {
    pub fn rule(&self) -> &Arc<RouteRule> {
        &self.rule
    }

    pub fn virtual_host(&self) -> &Arc<VirtualHost> {
        &self.vhost
    }

    pub fn select_cluster(&self) -> String {
        self.rule.select_cluster()
    }

    pub fn timeout(&self) -> Duration {
        self.rule.timeout()
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.rule.retry_policy()
    }

    /// Request rewrites compose rule, then virtual host, then global.
    pub fn finalize_request_headers(&self, headers: &mut Header) {
        self.rule.finalize_request(headers);
        self.vhost.request_parser.apply(headers);
        self.global_request_parser.apply(headers);
    }

    /// Response rewrites run the scopes in the reverse direction:
    /// global, then virtual host, then rule.
    pub fn finalize_response_headers(&self, headers: &mut Header) {
        self.global_response_parser.apply(headers);
        self.vhost.response_parser.apply(headers);
        self.rule.response_parser.apply(headers);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn header_value(key: &str, value: &str, append: bool) -> HeaderValueConfig {
        HeaderValueConfig {
            key: key.to_string(),
            value: value.to_string(),
            append,
        }
    }

    fn simple_vhost(name: &str, domains: &[&str], prefix: &str, cluster: &str) -> VirtualHostConfig {
        VirtualHostConfig {
            name: name.to_string(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
            routes: vec![RouteConfig {
                route_match: RouteMatchConfig {
                    prefix: Some(prefix.to_string()),
                    ..Default::default()
                },
                route: RouteActionConfig {
                    cluster_name: cluster.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn headers(authority: &str, path: &str) -> Header {
        let mut h = Header::new();
        h.add(AUTHORITY_HEADER, authority.as_bytes());
        h.add(PATH_HEADER, path.as_bytes());
        h
    }

    #[test]
    fn test_domain_precedence() {
        let config = RouterConfig {
            virtual_hosts: vec![
                simple_vhost("exact", &["api.example.com"], "/", "exact-cluster"),
                simple_vhost("long-wildcard", &["*.example.com"], "/", "long-cluster"),
                simple_vhost("short-wildcard", &["*.com"], "/", "short-cluster"),
                simple_vhost("default", &["*"], "/", "default-cluster"),
            ],
            ..Default::default()
        };
        let routers = Routers::new(&config).unwrap();

        let cases = [
            ("api.example.com", "exact-cluster"),
            ("web.example.com", "long-cluster"),
            ("other.com", "short-cluster"),
            ("unrelated.org", "default-cluster"),
        ];
        for (authority, expected) in cases {
            let matched = routers.match_route(&headers(authority, "/")).unwrap();
            assert_eq!(matched.select_cluster(), expected, "authority {}", authority);
        }
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let vh = VirtualHostConfig {
            name: "vh".to_string(),
            domains: vec!["*".to_string()],
            routes: vec![
                RouteConfig {
                    route_match: RouteMatchConfig {
                        prefix: Some("/api/".to_string()),
                        ..Default::default()
                    },
                    route: RouteActionConfig {
                        cluster_name: "api".to_string(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                RouteConfig {
                    route_match: RouteMatchConfig {
                        prefix: Some("/".to_string()),
                        ..Default::default()
                    },
                    route: RouteActionConfig {
                        cluster_name: "fallback".to_string(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let routers = Routers::new(&RouterConfig {
            virtual_hosts: vec![vh],
            ..Default::default()
        })
        .unwrap();

        let matched = routers.match_route(&headers("x", "/api/users")).unwrap();
        assert_eq!(matched.select_cluster(), "api");
        let matched = routers.match_route(&headers("x", "/other")).unwrap();
        assert_eq!(matched.select_cluster(), "fallback");
    }

    #[test]
    fn test_prefix_rewrite_through_match_route() {
        // vhost on `*` with prefix /index/ rewritten to /abc/
        let mut vh = simple_vhost("vh", &["*"], "/index/", "test");
        vh.routes[0].route.prefix_rewrite = Some("/abc/".to_string());
        let routers = Routers::new(&RouterConfig {
            virtual_hosts: vec![vh],
            ..Default::default()
        })
        .unwrap();

        let mut h = headers("x", "/index/page/");
        let matched = routers.match_route(&h).unwrap();
        matched.finalize_request_headers(&mut h);
        assert_eq!(h.get(PATH_HEADER), Some(b"/abc/page" as &[u8]));
        assert_eq!(
            h.get(ORIGINAL_PATH_HEADER),
            Some(b"/index/page/" as &[u8])
        );
    }

    #[test]
    fn test_rewrite_pipeline_scope_order() {
        let mut vh = simple_vhost("vh", &["*"], "/", "c");
        vh.routes[0].request_headers_to_add = vec![header_value("level", "1", true)];
        vh.routes[0].response_headers_to_add = vec![header_value("level", "rule", true)];
        vh.request_headers_to_add = vec![header_value("level", "2", true)];
        vh.response_headers_to_add = vec![header_value("level", "vhost", true)];

        let config = RouterConfig {
            virtual_hosts: vec![vh],
            request_headers_to_add: vec![header_value("level", "3", true)],
            response_headers_to_add: vec![header_value("level", "global", true)],
            ..Default::default()
        };
        let routers = Routers::new(&config).unwrap();

        let mut request = headers("x", "/");
        let matched = routers.match_route(&request).unwrap();
        matched.finalize_request_headers(&mut request);
        assert_eq!(request.get(b"level"), Some(b"1,2,3" as &[u8]));

        let mut response = Header::new();
        matched.finalize_response_headers(&mut response);
        assert_eq!(response.get(b"level"), Some(b"global,vhost,rule" as &[u8]));
    }

    #[test]
    fn test_no_virtual_host_or_rule_yields_none() {
        let config = RouterConfig {
            virtual_hosts: vec![simple_vhost("only", &["known.host"], "/api/", "c")],
            ..Default::default()
        };
        let routers = Routers::new(&config).unwrap();
        assert!(routers.match_route(&headers("unknown.host", "/api/")).is_none());
        assert!(routers.match_route(&headers("known.host", "/nope")).is_none());
    }
}
