use std::collections::HashMap;
use std::net::IpAddr;

/// Table of peers waiting to be matched, keyed by their observed host.
///
/// Values are reactor tokens of WAITING control connections; at most one
/// entry per host. Owned and mutated exclusively by the reactor thread, so
/// no locking.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    waiting: HashMap<IpAddr, u64>,
}

impl Registry {
    /// Insert `token` as the waiting connection for `host`, returning the
    /// token it displaced, if any. Failing the evictee is the caller's job.
    pub(crate) fn register(&mut self, host: IpAddr, token: u64) -> Option<u64> {
        self.waiting.insert(host, token).filter(|&old| old != token)
    }

    pub(crate) fn lookup(&self, host: &IpAddr) -> Option<u64> {
        self.waiting.get(host).copied()
    }

    /// Remove `token`'s entry for `host`. A no-op if `token` no longer owns
    /// the slot (a later LISTEN from the same host may have taken it).
    pub(crate) fn remove(&mut self, host: &IpAddr, token: u64) {
        if self.waiting.get(host) == Some(&token) {
            self.waiting.remove(host);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = Registry::default();
        assert_eq!(reg.register(host("10.0.0.1"), 1), None);
        assert_eq!(reg.lookup(&host("10.0.0.1")), Some(1));
        assert_eq!(reg.lookup(&host("10.0.0.2")), None);
    }

    #[test]
    fn second_registration_displaces_the_first() {
        let mut reg = Registry::default();
        reg.register(host("10.0.0.1"), 1);
        assert_eq!(reg.register(host("10.0.0.1"), 2), Some(1));
        assert_eq!(reg.lookup(&host("10.0.0.1")), Some(2));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_is_guarded_and_idempotent() {
        let mut reg = Registry::default();
        reg.register(host("10.0.0.1"), 1);

        // A stale owner cannot remove the current entry.
        reg.remove(&host("10.0.0.1"), 7);
        assert_eq!(reg.lookup(&host("10.0.0.1")), Some(1));

        reg.remove(&host("10.0.0.1"), 1);
        assert_eq!(reg.lookup(&host("10.0.0.1")), None);
        reg.remove(&host("10.0.0.1"), 1);
        assert_eq!(reg.len(), 0);
    }
}
