use std::sync::Arc;

use crate::protocol::Header;
use crate::AppResult;

use super::config::VirtualHostConfig;
use super::header_parser::HeaderParser;
use super::rule::RouteRule;

/// A named matcher over the authority header owning an ordered list of
/// rules; the first matching rule wins.
pub struct VirtualHost {
    name: String,
    domains: Vec<String>,
    rules: Vec<Arc<RouteRule>>,
    pub(super) request_parser: HeaderParser,
    pub(super) response_parser: HeaderParser,
}

impl VirtualHost {
    pub fn new(config: &VirtualHostConfig) -> AppResult<VirtualHost> {
        let rules = config
            .routes
            .iter()
            .map(|rc| RouteRule::new(rc).map(Arc::new))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(VirtualHost {
            name: config.name.clone(),
            domains: config
                .domains
                .iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
            rules,
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

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn match_route(&self, headers: &Header) -> Option<Arc<RouteRule>> {
        self.rules.iter().find(|rule| rule.matches(headers)).cloned()
    }
}
