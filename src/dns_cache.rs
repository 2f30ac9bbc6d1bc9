//! Process-lifetime DNS memoization.
//!
//! One entry per hostname, filled on first lookup and never refreshed:
//! probe comparisons assume every sample of a target hits the same
//! address. The per-entry mutex serializes concurrent resolutions of the
//! same name while leaving different names fully parallel. The resolver
//! is injected so tests can count resolutions.

use crate::error::RequestError;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

pub type ResolveFn = dyn Fn(&str) -> io::Result<Vec<IpAddr>> + Send + Sync;

pub struct DnsCache {
    resolve: Box<ResolveFn>,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
}

#[derive(Default)]
struct Entry {
    slot: Mutex<Option<IpAddr>>,
}

fn system_resolve(name: &str) -> io::Result<Vec<IpAddr>> {
    Ok((name, 0u16)
        .to_socket_addrs()?
        .map(|a| a.ip())
        .collect())
}

impl DnsCache {
    pub fn new() -> Self {
        Self::with_resolver(Box::new(system_resolve))
    }

    pub fn with_resolver(resolve: Box<ResolveFn>) -> Self {
        DnsCache {
            resolve,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves `name`, preferring IPv4, memoizing the result for the
    /// process lifetime.
    pub fn lookup(&self, name: &str) -> Result<IpAddr, RequestError> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(ip);
        }

        let entry = {
            let mut entries = self.entries.lock().unwrap();
            entries.entry(name.to_string()).or_default().clone()
        };

        // Holding only the entry lock here: a slow resolution of one name
        // must not block lookups of others.
        let mut slot = entry.slot.lock().unwrap();
        if let Some(ip) = *slot {
            return Ok(ip);
        }

        let ips = (self.resolve)(name).map_err(|e| RequestError::Dns {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let mut best: Option<IpAddr> = None;
        for ip in &ips {
            if ip.is_ipv4() {
                best = Some(*ip);
            }
            if best.is_none() {
                best = Some(*ip);
            }
        }
        let best = best.ok_or_else(|| RequestError::Dns {
            name: name.to_string(),
            reason: "no such host".to_string(),
        })?;

        *slot = Some(best);
        Ok(best)
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn concurrent_lookups_resolve_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let cache = DnsCache::with_resolver(Box::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            Ok(vec!["192.0.2.7".parse().unwrap()])
        }));

        std::thread::scope(|s| {
            for _ in 0..50 {
                s.spawn(|| {
                    for _ in 0..20 {
                        assert_eq!(
                            cache.lookup("host").unwrap(),
                            "192.0.2.7".parse::<IpAddr>().unwrap()
                        );
                    }
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prefers_ipv4_over_ipv6() {
        let cache = DnsCache::with_resolver(Box::new(|_| {
            Ok(vec![
                "2001:db8::1".parse().unwrap(),
                "192.0.2.1".parse().unwrap(),
                "2001:db8::2".parse().unwrap(),
            ])
        }));
        assert_eq!(
            cache.lookup("host").unwrap(),
            "192.0.2.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn ip_literals_bypass_resolution() {
        let cache = DnsCache::with_resolver(Box::new(|_| {
            panic!("resolver must not run for literals")
        }));
        assert_eq!(
            cache.lookup("203.0.113.9").unwrap(),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn different_names_resolve_independently() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let cache = DnsCache::with_resolver(Box::new(move |name| {
            counted.fetch_add(1, Ordering::SeqCst);
            match name {
                "a" => Ok(vec!["192.0.2.1".parse().unwrap()]),
                _ => Ok(vec!["192.0.2.2".parse().unwrap()]),
            }
        }));
        cache.lookup("a").unwrap();
        cache.lookup("b").unwrap();
        cache.lookup("a").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_result_is_an_error() {
        let cache = DnsCache::with_resolver(Box::new(|_| Ok(vec![])));
        assert!(matches!(
            cache.lookup("host"),
            Err(RequestError::Dns { .. })
        ));
    }
}
