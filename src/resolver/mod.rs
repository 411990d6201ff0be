//! DNS resolution with a bounded timeout and a small forward-lookup cache.
//!
//! The standard library's `ToSocketAddrs` resolves on a blocking thread under
//! the hood; there is no way to cancel an in-flight getaddrinfo(3) call once
//! started. Rather than risk leaking blocked OS threads, a lookup that blows
//! its timeout budget is *abandoned*, not cancelled: the spawned task keeps
//! running to completion in the background and its result is simply dropped.

use crate::utils::error::{ProxyError, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for a forward or reverse DNS lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Default capacity of the forward-resolution cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Resolves domain names to socket addresses with a small bounded cache.
///
/// Eviction is oldest-inserted-first once the cache is full; this is a
/// correctness-preserving simplification of a true LRU and is sufficient for
/// a cache whose purpose is cutting repeat-lookup latency, not exactness.
pub struct Resolver {
    timeout: Duration,
    cache: Mutex<Cache>,
}

struct Cache {
    capacity: usize,
    entries: HashMap<String, SocketAddr>,
    order: Vec<String>,
}

impl Cache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn get(&self, key: &str) -> Option<SocketAddr> {
        self.entries.get(key).copied()
    }

    fn insert(&mut self, key: String, value: SocketAddr) {
        if self.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&key) {
            if self.entries.len() >= self.capacity {
                if let Some(oldest) = (!self.order.is_empty()).then(|| self.order.remove(0)) {
                    self.entries.remove(&oldest);
                }
            }
            self.order.push(key.clone());
        }
        self.entries.insert(key, value);
    }
}

/// Outcome of a [`bounded_lookup`] call.
enum LookupOutcome<T> {
    Done(T),
    TimedOut,
    Panicked,
}

/// Runs `fut` on its own task and waits at most `budget` for it. Past the
/// budget the task is abandoned, not cancelled: `getaddrinfo(3)`/
/// `getnameinfo(3)` can't be interrupted once started, so the task keeps
/// running in the background and its eventual result is simply discarded.
async fn bounded_lookup<F, T>(budget: Duration, fut: F) -> LookupOutcome<T>
where
    F: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(budget, tokio::spawn(fut)).await {
        Ok(Ok(value)) => LookupOutcome::Done(value),
        Ok(Err(_join_err)) => LookupOutcome::Panicked,
        Err(_timeout) => LookupOutcome::TimedOut,
    }
}

impl Resolver {
    pub fn new(timeout: Duration, cache_capacity: usize) -> Self {
        Self {
            timeout,
            cache: Mutex::new(Cache::new(cache_capacity)),
        }
    }

    /// Resolve `host:port` to the first address the OS returns. No reordering
    /// (e.g. preferring IPv6) is applied; whatever `getaddrinfo` hands back
    /// first is what gets used, matching a plain client's behavior.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let cache_key = format!("{host}:{port}");
        if let Some(cached) = self.cache.lock().expect("resolver cache poisoned").get(&cache_key) {
            debug!(%host, port, "resolved from cache");
            return Ok(cached);
        }

        let query = format!("{host}:{port}");
        let outcome = bounded_lookup(self.timeout, async move {
            tokio::net::lookup_host(query)
                .await
                .ok()
                .and_then(|mut addrs| addrs.next())
        })
        .await;

        let resolved = match outcome {
            LookupOutcome::Done(Some(addr)) => addr,
            LookupOutcome::Done(None) => {
                return Err(ProxyError::Protocol(format!(
                    "no addresses found for {host}"
                )))
            }
            LookupOutcome::Panicked => {
                return Err(ProxyError::Protocol(format!(
                    "resolution task for {host} panicked"
                )))
            }
            LookupOutcome::TimedOut => {
                warn!(%host, port, "DNS resolution timed out; abandoning in-flight lookup");
                return Err(ProxyError::Protocol(format!(
                    "resolution of {host} timed out"
                )));
            }
        };

        self.cache
            .lock()
            .expect("resolver cache poisoned")
            .insert(cache_key, resolved);

        Ok(resolved)
    }

    /// Reverse-resolve an address for logging purposes only; failures are
    /// swallowed and the raw IP is used as a fallback since a client's
    /// traffic must never be held up by a PTR lookup. `getnameinfo(3)` blocks
    /// the calling thread, so the lookup runs on the blocking pool and is
    /// abandoned (not cancelled) past the timeout, same as `resolve`.
    pub async fn reverse_for_logging(&self, addr: IpAddr) -> String {
        let outcome = bounded_lookup(self.timeout, async move {
            tokio::task::spawn_blocking(move || dns_lookup_reverse(addr))
                .await
                .ok()
                .flatten()
        })
        .await;

        match outcome {
            LookupOutcome::Done(Some(name)) => name,
            _ => addr.to_string(),
        }
    }
}

/// Blocking PTR lookup via `getnameinfo(3)`. Returns `None` on any failure
/// or when the system has no PTR record (the call falls back to printing
/// the numeric address, which carries no information over the caller's own
/// fallback).
fn dns_lookup_reverse(addr: IpAddr) -> Option<String> {
    let mut host = vec![0 as libc::c_char; libc::NI_MAXHOST as usize];

    let ret = match addr {
        IpAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: 0,
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                libc::getnameinfo(
                    &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    host.as_mut_ptr(),
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    0,
                )
            }
        }
        IpAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: 0,
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.octets(),
                },
                sin6_scope_id: 0,
            };
            unsafe {
                libc::getnameinfo(
                    &sin6 as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    host.as_mut_ptr(),
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    0,
                )
            }
        }
    };

    if ret != 0 {
        return None;
    }

    let name = unsafe { std::ffi::CStr::from_ptr(host.as_ptr()) }
        .to_str()
        .ok()?
        .to_string();

    if name == addr.to_string() {
        return None;
    }

    Some(name)
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKUP_TIMEOUT, DEFAULT_CACHE_CAPACITY)
    }
}
