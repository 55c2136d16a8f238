use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use tracing::info;

use super::{Protocol, ProtocolName};

// read-mostly: registration happens at startup, lookups on every
// connection setup
static PROTOCOLS: Lazy<RwLock<HashMap<ProtocolName, Arc<dyn Protocol>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a codec under its own name. Registration is idempotent in
/// name: a duplicate replaces the prior codec.
pub fn register_protocol(codec: Arc<dyn Protocol>) {
    let name = codec.name();
    let prev = PROTOCOLS
        .write()
        .expect("protocol registry lock poisoned")
        .insert(name, codec);
    if prev.is_some() {
        info!("protocol {} re-registered, prior codec replaced", name);
    }
}

pub fn protocol(name: &str) -> Option<Arc<dyn Protocol>> {
    PROTOCOLS
        .read()
        .expect("protocol registry lock poisoned")
        .get(name)
        .cloned()
}
