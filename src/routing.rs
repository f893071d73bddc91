use std::{collections::HashMap, sync::Mutex};

use crate::{addressing::random_subdomain, error::ServerError};

// Process-wide map from fully qualified domain to tunnel handle.
//
// A single mutex guards the map. `bind` keeps it held across candidate
// allocation and insertion, so two concurrent requests can neither claim the
// same explicit subdomain nor collide on a randomly picked one.
pub(crate) struct RoutingTable<H> {
    base_domain: String,
    map: Mutex<HashMap<String, H>>,
}

impl<H: Clone> RoutingTable<H> {
    pub(crate) fn new(base_domain: String) -> Self {
        RoutingTable {
            base_domain,
            map: Mutex::new(HashMap::new()),
        }
    }

    // Install a handler under the requested subdomain, or under a fresh
    // random one when no subdomain is requested. Returns the fully qualified
    // domain that was granted. Explicit subdomains are first-come-first-served.
    pub(crate) fn bind(&self, subdomain: Option<&str>, handler: H) -> Result<String, ServerError> {
        let mut map = self.map.lock().unwrap();
        let domain = match subdomain {
            Some(subdomain) => {
                let domain = self.qualify(subdomain);
                if map.contains_key(&domain) {
                    return Err(ServerError::DomainTaken(domain));
                }
                domain
            }
            None => loop {
                let candidate = self.qualify(&random_subdomain());
                if !map.contains_key(&candidate) {
                    break candidate;
                }
            },
        };
        map.insert(domain.clone(), handler);
        Ok(domain)
    }

    // Look up the tunnel for a Host header value. Any port component is
    // stripped before comparison; the remaining hostname must match exactly.
    pub(crate) fn get(&self, host: &str) -> Option<H> {
        let host = host.split(':').next().unwrap_or_default();
        self.map.lock().unwrap().get(host).cloned()
    }

    pub(crate) fn remove(&self, domain: &str) -> Option<H> {
        self.map.lock().unwrap().remove(domain)
    }

    fn qualify(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain.to_ascii_lowercase(), self.base_domain)
    }
}
