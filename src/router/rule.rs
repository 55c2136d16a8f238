use std::time::Duration;

use rand::Rng;
use regex::Regex;
use tracing::warn;

use crate::protocol::Header;
use crate::{AppError, AppResult};

use super::config::{RetryPolicyConfig, RouteConfig};
use super::header_parser::HeaderParser;
use super::{AUTHORITY_HEADER, ORIGINAL_PATH_HEADER, PATH_HEADER};

enum PathMatcher {
    Prefix(String),
    Path(String),
    Regex(Regex),
}

struct HeaderMatcher {
    name: String,
    value: String,
    regex: Option<Regex>,
}

struct WeightedClusterEntry {
    name: String,
    weight: u32,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub num_retries: u32,
    pub retry_timeout: Duration,
}

/// One routing rule: a path matcher plus header predicates, the target
/// cluster action and the rule-level header rewriters.
pub struct RouteRule {
    matcher: PathMatcher,
    case_sensitive: bool,
    header_matchers: Vec<HeaderMatcher>,
    cluster_name: String,
    weighted: Vec<WeightedClusterEntry>,
    total_weight: u32,
    host_rewrite: Option<String>,
    prefix_rewrite: Option<String>,
    timeout: Duration,
    retry_policy: Option<RetryPolicy>,
    pub(super) request_parser: HeaderParser,
    pub(super) response_parser: HeaderParser,
}

fn anchored(pattern: &str) -> AppResult<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| AppError::IllegalState(format!("bad route regex {:?}: {}", pattern, e)))
}

impl RouteRule {
    pub fn new(config: &RouteConfig) -> AppResult<RouteRule> {
        let m = &config.route_match;
        let matcher = if let Some(path) = &m.path {
            PathMatcher::Path(path.clone())
        } else if let Some(pattern) = &m.regex {
            PathMatcher::Regex(anchored(pattern)?)
        } else {
            // absent prefix matches every path
            PathMatcher::Prefix(m.prefix.clone().unwrap_or_else(|| "/".to_string()))
        };

        let header_matchers = m
            .headers
            .iter()
            .map(|hm| {
                let regex = if hm.regex {
                    Some(anchored(&hm.value)?)
                } else {
                    None
                };
                Ok(HeaderMatcher {
                    name: hm.name.to_ascii_lowercase(),
                    value: hm.value.clone(),
                    regex,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        let weighted: Vec<WeightedClusterEntry> = config
            .route
            .weighted_clusters
            .iter()
            .map(|wc| WeightedClusterEntry {
                name: wc.name.clone(),
                weight: wc.weight,
            })
            .collect();
        let total_weight: u32 = weighted.iter().map(|w| w.weight).sum();
        if !weighted.is_empty() && total_weight != 100 {
            // accepted anyway, the draw runs over the actual sum
            warn!(
                "weighted clusters for {} sum to {} instead of 100",
                config.route.cluster_name, total_weight
            );
        }

        Ok(RouteRule {
            matcher,
            case_sensitive: m.case_sensitive.unwrap_or(false),
            header_matchers,
            cluster_name: config.route.cluster_name.clone(),
            weighted,
            total_weight,
            host_rewrite: config.route.host_rewrite.clone(),
            prefix_rewrite: config.route.prefix_rewrite.clone(),
            timeout: Duration::from_millis(config.route.timeout_ms),
            retry_policy: config.route.retry_policy.as_ref().map(|rp| RetryPolicy {
                num_retries: rp.num_retries,
                retry_timeout: Duration::from_millis(rp.retry_timeout_ms),
            }),
            request_parser: HeaderParser::new(
                &config.request_headers_to_add,
                &config.request_headers_to_remove,
            ),
            response_parser: HeaderParser::new(
                &config.response_headers_to_add,
                &config.response_headers_to_remove,
            ),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    fn path_of(headers: &Header) -> String {
        headers
            .get(PATH_HEADER)
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_else(|| "/".to_string())
    }

    pub fn matches(&self, headers: &Header) -> bool {
        let path = Self::path_of(headers);
        let path_ok = match &self.matcher {
            PathMatcher::Prefix(prefix) => {
                if self.case_sensitive {
                    path.starts_with(prefix)
                } else {
                    path.to_ascii_lowercase()
                        .starts_with(&prefix.to_ascii_lowercase())
                }
            }
            PathMatcher::Path(exact) => {
                if self.case_sensitive {
                    path == *exact
                } else {
                    path.eq_ignore_ascii_case(exact)
                }
            }
            PathMatcher::Regex(regex) => regex.is_match(&path),
        };
        if !path_ok {
            return false;
        }
        self.header_matchers.iter().all(|hm| {
            let Some(value) = headers.get(hm.name.as_bytes()) else {
                return false;
            };
            let value = String::from_utf8_lossy(value);
            match &hm.regex {
                Some(regex) => regex.is_match(&value),
                None => value == hm.value,
            }
        })
    }

    /// Resolve the action's target. A weighted action draws uniformly
    /// over the cumulative weights; the plain cluster name is only used
    /// when no weighted list is configured.
    pub fn select_cluster(&self) -> String {
        if self.weighted.is_empty() || self.total_weight == 0 {
            return self.cluster_name.clone();
        }
        let mut draw = rand::thread_rng().gen_range(0..self.total_weight);
        for entry in &self.weighted {
            if draw < entry.weight {
                return entry.name.clone();
            }
            draw -= entry.weight;
        }
        // unreachable with a correct cumulative walk
        self.cluster_name.clone()
    }

    /// Rule-level parts of the request rewrite: add/remove pairs, host
    /// rewrite and prefix rewrite with the original path preserved.
    pub(super) fn finalize_request(&self, headers: &mut Header) {
        self.request_parser.apply(headers);
        if let Some(host) = &self.host_rewrite {
            headers.set(AUTHORITY_HEADER, host.as_bytes());
        }
        self.finalize_path(headers);
    }

    fn finalize_path(&self, headers: &mut Header) {
        let Some(rewrite) = &self.prefix_rewrite else {
            return;
        };
        let path = Self::path_of(headers);
        let matched_len = match &self.matcher {
            PathMatcher::Prefix(prefix) => prefix.len(),
            PathMatcher::Path(exact) => exact.len(),
            PathMatcher::Regex(_) => path.len(),
        };
        if matched_len > path.len() {
            return;
        }
        let rest = &path[matched_len..];
        let mut rewritten = format!("{}{}", rewrite, rest);
        if !rest.is_empty() && rewritten.ends_with('/') {
            rewritten.pop();
        }
        headers.set(ORIGINAL_PATH_HEADER, path.as_bytes());
        headers.set(PATH_HEADER, rewritten.as_bytes());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::router::config::{
        RouteActionConfig, RouteMatchConfig, WeightedClusterConfig,
    };

    fn prefix_route(prefix: &str, cluster: &str) -> RouteConfig {
        RouteConfig {
            route_match: RouteMatchConfig {
                prefix: Some(prefix.to_string()),
                ..Default::default()
            },
            route: RouteActionConfig {
                cluster_name: cluster.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn headers_with_path(path: &str) -> Header {
        let mut headers = Header::new();
        headers.add(PATH_HEADER, path.as_bytes());
        headers
    }

    #[test]
    fn test_prefix_match() {
        let cases = [
            ("/", "/", true),
            ("/", "/test", true),
            ("/", "/test/foo", true),
            ("/", "/foo?key=value", true),
            ("/foo", "/foo", true),
            ("/foo", "/footest", true),
            ("/foo", "/foo/test", true),
            ("/foo", "/foo?key=value", true),
            ("/foo", "/", false),
            ("/foo", "/test", false),
        ];
        for (prefix, path, expected) in cases {
            let rule = RouteRule::new(&prefix_route(prefix, "test")).unwrap();
            assert_eq!(
                rule.matches(&headers_with_path(path)),
                expected,
                "prefix {:?} against {:?}",
                prefix,
                path
            );
        }
    }

    #[test]
    fn test_path_match_case_sensitivity() {
        let cases = [
            ("/test", "/test", None, true),
            ("/test", "/Test", None, true),
            ("/test", "/Test", Some(true), false),
            ("/test", "/test/test", None, false),
        ];
        for (path, header_path, case_sensitive, expected) in cases {
            let mut config = RouteConfig {
                route_match: RouteMatchConfig {
                    path: Some(path.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            config.route_match.case_sensitive = case_sensitive;
            let rule = RouteRule::new(&config).unwrap();
            assert_eq!(
                rule.matches(&headers_with_path(header_path)),
                expected,
                "path {:?} against {:?} (case_sensitive {:?})",
                path,
                header_path,
                case_sensitive
            );
        }
    }

    #[test]
    fn test_regex_match_is_anchored() {
        let cases = [
            (".*", "/", true),
            (".*", "/path", true),
            ("/[0-9]+", "/12345", true),
            ("/[0-9]+", "/test", false),
            ("/[0-9]+", "/12345/tail", false),
        ];
        for (pattern, path, expected) in cases {
            let config = RouteConfig {
                route_match: RouteMatchConfig {
                    regex: Some(pattern.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            let rule = RouteRule::new(&config).unwrap();
            assert_eq!(
                rule.matches(&headers_with_path(path)),
                expected,
                "regex {:?} against {:?}",
                pattern,
                path
            );
        }
    }

    #[test]
    fn test_header_predicates() {
        let config = RouteConfig {
            route_match: RouteMatchConfig {
                prefix: Some("/".to_string()),
                headers: vec![
                    crate::router::config::HeaderMatchConfig {
                        name: "X-Stage".to_string(),
                        value: "canary".to_string(),
                        regex: false,
                    },
                    crate::router::config::HeaderMatchConfig {
                        name: "x-version".to_string(),
                        value: "v[12]".to_string(),
                        regex: true,
                    },
                ],
                ..Default::default()
            },
            ..Default::default()
        };
        let rule = RouteRule::new(&config).unwrap();

        let mut headers = headers_with_path("/anything");
        headers.add(b"x-stage", b"canary");
        headers.add(b"x-version", b"v2");
        assert!(rule.matches(&headers));

        headers.set(b"x-version", b"v3");
        assert!(!rule.matches(&headers));

        headers.remove(b"x-stage");
        assert!(!rule.matches(&headers));
    }

    #[test]
    fn test_weighted_cluster_selection_ratio() {
        let config = RouteConfig {
            route: RouteActionConfig {
                cluster_name: "defaultCluster".to_string(),
                weighted_clusters: vec![
                    WeightedClusterConfig {
                        name: "w1".to_string(),
                        weight: 90,
                        ..Default::default()
                    },
                    WeightedClusterConfig {
                        name: "w2".to_string(),
                        weight: 10,
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
            ..Default::default()
        };
        let rule = RouteRule::new(&config).unwrap();

        let (mut w1, mut w2, mut other) = (0u32, 0u32, 0u32);
        for _ in 0..10_000 {
            match rule.select_cluster().as_str() {
                "w1" => w1 += 1,
                "w2" => w2 += 1,
                _ => other += 1,
            }
        }
        assert_eq!(other, 0, "the default cluster is never selected");
        let ratio = w1 as f64 / w2 as f64;
        assert!(
            (ratio - 9.0).abs() <= 1.0,
            "w1/w2 ratio {} should approach 9",
            ratio
        );
    }

    #[test]
    fn test_prefix_rewrite_preserves_original_path() {
        let mut config = prefix_route("/index/", "test");
        config.route.prefix_rewrite = Some("/abc/".to_string());
        let rule = RouteRule::new(&config).unwrap();

        let mut headers = headers_with_path("/index/page/");
        rule.finalize_request(&mut headers);
        assert_eq!(headers.get(PATH_HEADER), Some(b"/abc/page" as &[u8]));
        assert_eq!(
            headers.get(ORIGINAL_PATH_HEADER),
            Some(b"/index/page/" as &[u8])
        );

        // the whole path equal to the prefix rewrites to the target
        let mut config = prefix_route("/", "test");
        config.route.prefix_rewrite = Some("/abc/".to_string());
        let rule = RouteRule::new(&config).unwrap();
        let mut headers = headers_with_path("/");
        rule.finalize_request(&mut headers);
        assert_eq!(headers.get(PATH_HEADER), Some(b"/abc/" as &[u8]));
        assert_eq!(headers.get(ORIGINAL_PATH_HEADER), Some(b"/" as &[u8]));
    }

    #[test]
    fn test_host_rewrite_replaces_authority() {
        let mut config = prefix_route("/", "test");
        config.route.host_rewrite = Some("www.example.com".to_string());
        let rule = RouteRule::new(&config).unwrap();
        let mut headers = headers_with_path("/");
        headers.add(AUTHORITY_HEADER, b"orig.host");
        rule.finalize_request(&mut headers);
        assert_eq!(
            headers.get(AUTHORITY_HEADER),
            Some(b"www.example.com" as &[u8])
        );
    }
}
