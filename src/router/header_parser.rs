use crate::protocol::Header;

use super::config::HeaderValueConfig;

struct HeaderPair {
    key: String,
    value: String,
    append: bool,
}

/// One rewrite level: additions applied in declared order, then
/// removals. Keys are lower-cased once at build time.
pub struct HeaderParser {
    to_add: Vec<HeaderPair>,
    to_remove: Vec<String>,
}

impl HeaderParser {
    pub fn new(adds: &[HeaderValueConfig], removes: &[String]) -> HeaderParser {
        HeaderParser {
            to_add: adds
                .iter()
                .map(|hv| HeaderPair {
                    key: hv.key.to_ascii_lowercase(),
                    value: hv.value.clone(),
                    append: hv.append,
                })
                .collect(),
            to_remove: removes.iter().map(|k| k.to_ascii_lowercase()).collect(),
        }
    }

    pub fn empty() -> HeaderParser {
        HeaderParser {
            to_add: Vec::new(),
            to_remove: Vec::new(),
        }
    }

    pub fn apply(&self, headers: &mut Header) {
        for pair in &self.to_add {
            if pair.append {
                let joined = headers
                    .get(pair.key.as_bytes())
                    .map(|existing| String::from_utf8_lossy(existing).into_owned());
                match joined {
                    Some(existing) => {
                        let value = format!("{},{}", existing, pair.value);
                        headers.set(pair.key.as_bytes(), value.as_bytes());
                    }
                    None => headers.set(pair.key.as_bytes(), pair.value.as_bytes()),
                }
            } else {
                headers.set(pair.key.as_bytes(), pair.value.as_bytes());
            }
        }
        for key in &self.to_remove {
            headers.remove(key.as_bytes());
        }
    }
}
