//! In-scope and blacklisted networks.
//!
//! Entries are kept in insertion order behind a single `RwLock`. Duplicate
//! detection compares canonical network strings; scope checks use real
//! containment, so a blacklisted /32 can punch a hole into a scoped /24.

use chrono::Utc;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::ScopeError;
use crate::target::{canonical_network, overlaps, Target};
use crate::types::{ScopeChange, ScopeChangeKind, ScopeEntry, ScopeId};

#[derive(Debug, Default)]
struct ScopeInner {
    next_id: ScopeId,
    entries: Vec<ScopeEntry>,
    history: Vec<ScopeChange>,
}

#[derive(Debug, Default)]
pub struct ScopeStore {
    inner: RwLock<ScopeInner>,
}

/// Outcome of a bulk import. Every non-blank, non-comment line lands in
/// exactly one of the two lists.
#[derive(Debug, Default)]
pub struct ImportReport {
    pub added: Vec<ScopeEntry>,
    pub failed: Vec<ImportFailure>,
}

#[derive(Debug)]
pub struct ImportFailure {
    pub line: usize,
    pub content: String,
    pub error: ScopeError,
}

impl ScopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from persisted entries and history
    pub fn restore(entries: Vec<ScopeEntry>, history: Vec<ScopeChange>) -> Self {
        let next_id = entries.iter().map(|e| e.id).max().map_or(0, |max| max + 1);
        let history_max = history.iter().map(|c| c.entry_id + 1).max().unwrap_or(0);
        log::debug!("[scope] restore: entries={} history={}", entries.len(), history.len());
        Self {
            inner: RwLock::new(ScopeInner {
                next_id: next_id.max(history_max),
                entries,
                history,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ScopeInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ScopeInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, network: &str, blacklisted: bool) -> Result<ScopeEntry, ScopeError> {
        let network = canonical_network(network).map_err(|e| ScopeError::InvalidNetwork { input: e.input })?;

        let mut inner = self.write();
        if let Some(existing) = inner.entries.iter().find(|e| e.network == network) {
            log::debug!("[scope] add_rejected: network={} existing_id={}", existing.canonical(), existing.id);
            return Err(ScopeError::AlreadyExists { network: existing.canonical() });
        }

        let now = Utc::now();
        let entry = ScopeEntry {
            id: inner.next_id,
            network,
            blacklisted,
            added_at: now,
        };
        inner.next_id += 1;
        inner.entries.push(entry.clone());
        inner.history.push(ScopeChange {
            at: now,
            entry_id: entry.id,
            network,
            kind: ScopeChangeKind::Added { blacklisted },
        });

        log::info!("[scope] added: id={} network={} blacklisted={}", entry.id, entry.canonical(), blacklisted);
        Ok(entry)
    }

    pub fn remove(&self, id: ScopeId) -> Result<ScopeEntry, ScopeError> {
        let mut inner = self.write();
        let index = inner
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(ScopeError::NotFound { id })?;

        let entry = inner.entries.remove(index);
        inner.history.push(ScopeChange {
            at: Utc::now(),
            entry_id: id,
            network: entry.network,
            kind: ScopeChangeKind::Removed,
        });

        log::info!("[scope] removed: id={} network={}", id, entry.canonical());
        Ok(entry)
    }

    pub fn toggle_blacklist(&self, id: ScopeId) -> Result<ScopeEntry, ScopeError> {
        let mut inner = self.write();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(ScopeError::NotFound { id })?;

        entry.blacklisted = !entry.blacklisted;
        let updated = entry.clone();
        inner.history.push(ScopeChange {
            at: Utc::now(),
            entry_id: id,
            network: updated.network,
            kind: ScopeChangeKind::BlacklistToggled { blacklisted: updated.blacklisted },
        });

        log::info!("[scope] blacklist_toggled: id={} network={} blacklisted={}",
            id, updated.canonical(), updated.blacklisted);
        Ok(updated)
    }

    /// In scope when some scope entry contains the address and no
    /// blacklist entry does.
    pub fn is_in_scope(&self, address: IpAddr) -> bool {
        let inner = self.read();
        let mut scoped = false;
        for entry in inner.entries.iter().filter(|e| e.network.contains(address)) {
            if entry.blacklisted {
                return false;
            }
            scoped = true;
        }
        scoped
    }

    /// A network is covered when a single scope entry contains all of it and
    /// no blacklist entry overlaps any part of it.
    pub fn covers(&self, network: &IpNetwork) -> bool {
        let inner = self.read();
        let mut scoped = false;
        for entry in &inner.entries {
            if entry.blacklisted {
                if overlaps(&entry.network, network) {
                    return false;
                }
            } else if entry.network.prefix() <= network.prefix() && entry.network.contains(network.network()) {
                scoped = true;
            }
        }
        scoped
    }

    pub fn admits(&self, target: &Target) -> bool {
        match target {
            Target::Address(ip) => self.is_in_scope(*ip),
            Target::Network(net) => self.covers(net),
        }
    }

    pub fn get(&self, id: ScopeId) -> Option<ScopeEntry> {
        self.read().entries.iter().find(|e| e.id == id).cloned()
    }

    pub fn list_scope(&self) -> Vec<ScopeEntry> {
        self.read().entries.iter().filter(|e| !e.blacklisted).cloned().collect()
    }

    pub fn list_blacklist(&self) -> Vec<ScopeEntry> {
        self.read().entries.iter().filter(|e| e.blacklisted).cloned().collect()
    }

    pub fn entries(&self) -> Vec<ScopeEntry> {
        self.read().entries.clone()
    }

    pub fn history(&self) -> Vec<ScopeChange> {
        self.read().history.clone()
    }

    /// Import one network per line. Blank lines and `#` comments are skipped.
    pub fn import(&self, text: &str, blacklisted: bool) -> ImportReport {
        let mut report = ImportReport::default();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match self.add(line, blacklisted) {
                Ok(entry) => report.added.push(entry),
                Err(error) => {
                    log::warn!("[scope] import_line_failed: line={} content={} error={}", idx + 1, line, error);
                    report.failed.push(ImportFailure {
                        line: idx + 1,
                        content: line.to_string(),
                        error,
                    });
                }
            }
        }

        log::info!("[scope] import_completed: blacklisted={} added={} failed={}",
            blacklisted, report.added.len(), report.failed.len());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_add_twice_fails() {
        let store = ScopeStore::new();
        store.add("10.0.0.0/24", false).unwrap();
        let err = store.add("10.0.0.0/24", false).unwrap_err();
        assert_eq!(err, ScopeError::AlreadyExists { network: "10.0.0.0/24".to_string() });
    }

    #[test]
    fn test_duplicate_detected_after_canonicalization() {
        let store = ScopeStore::new();
        store.add("10.0.0.0/24", false).unwrap();
        // host bits set, opposite flag: still the same canonical network
        assert!(matches!(store.add("10.0.0.99/24", true), Err(ScopeError::AlreadyExists { .. })));

        store.add("192.168.1.7", false).unwrap();
        assert!(matches!(store.add("192.168.1.7/32", false), Err(ScopeError::AlreadyExists { .. })));
    }

    #[test]
    fn test_invalid_network_rejected() {
        let store = ScopeStore::new();
        assert!(matches!(store.add("not-a-network", false), Err(ScopeError::InvalidNetwork { .. })));
        assert!(matches!(store.add("10.0.0.0/40", false), Err(ScopeError::InvalidNetwork { .. })));
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_blacklist_wins() {
        let store = ScopeStore::new();
        store.add("10.0.0.0/24", false).unwrap();
        store.add("10.0.0.5/32", true).unwrap();

        assert!(!store.is_in_scope(ip("10.0.0.5")));
        assert!(store.is_in_scope(ip("10.0.0.6")));
        assert!(!store.is_in_scope(ip("10.0.1.6")));
    }

    #[test]
    fn test_blacklist_wins_regardless_of_insert_order() {
        let store = ScopeStore::new();
        store.add("172.16.0.0/12", true).unwrap();
        store.add("172.16.4.0/24", false).unwrap();
        assert!(!store.is_in_scope(ip("172.16.4.10")));
    }

    #[test]
    fn test_covers_network_targets() {
        let store = ScopeStore::new();
        store.add("10.0.0.0/16", false).unwrap();
        store.add("10.0.9.128/25", true).unwrap();

        assert!(store.covers(&canonical_network("10.0.3.0/24").unwrap()));
        assert!(!store.covers(&canonical_network("10.0.9.0/24").unwrap()));
        assert!(!store.covers(&canonical_network("10.0.0.0/8").unwrap()));
    }

    #[test]
    fn test_remove_and_not_found() {
        let store = ScopeStore::new();
        let entry = store.add("10.0.0.0/24", false).unwrap();
        store.remove(entry.id).unwrap();
        assert_eq!(store.remove(entry.id), Err(ScopeError::NotFound { id: entry.id }));
        assert!(!store.is_in_scope(ip("10.0.0.1")));
    }

    #[test]
    fn test_toggle_blacklist_is_recorded() {
        let store = ScopeStore::new();
        let entry = store.add("10.0.0.0/24", false).unwrap();
        let toggled = store.toggle_blacklist(entry.id).unwrap();
        assert!(toggled.blacklisted);
        assert!(!store.is_in_scope(ip("10.0.0.1")));

        let history = store.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].kind, ScopeChangeKind::BlacklistToggled { blacklisted: true });
        assert_eq!(store.toggle_blacklist(42), Err(ScopeError::NotFound { id: 42 }));
    }

    #[test]
    fn test_lists_keep_insertion_order() {
        let store = ScopeStore::new();
        store.add("10.2.0.0/16", false).unwrap();
        store.add("10.1.0.0/16", false).unwrap();
        store.add("10.1.1.1", true).unwrap();

        let scope: Vec<String> = store.list_scope().iter().map(|e| e.canonical()).collect();
        assert_eq!(scope, vec!["10.2.0.0/16", "10.1.0.0/16"]);
        let blacklist: Vec<String> = store.list_blacklist().iter().map(|e| e.canonical()).collect();
        assert_eq!(blacklist, vec!["10.1.1.1/32"]);
        // restartable: a second listing yields the same sequence
        assert_eq!(store.list_scope(), store.list_scope());
    }

    #[test]
    fn test_import_reports_bad_lines() {
        let store = ScopeStore::new();
        let text = "# corp ranges\n10.0.0.0/24\n\nbogus\n10.0.0.0/24\n192.168.0.1\n";
        let report = store.import(text, false);

        assert_eq!(report.added.len(), 2);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].line, 4);
        assert!(matches!(report.failed[0].error, ScopeError::InvalidNetwork { .. }));
        assert_eq!(report.failed[1].line, 5);
        assert!(matches!(report.failed[1].error, ScopeError::AlreadyExists { .. }));
    }

    #[test]
    fn test_restore_continues_ids() {
        let store = ScopeStore::new();
        store.add("10.0.0.0/24", false).unwrap();
        let removed = store.add("10.0.1.0/24", false).unwrap();
        store.remove(removed.id).unwrap();

        let restored = ScopeStore::restore(store.entries(), store.history());
        let next = restored.add("10.0.2.0/24", false).unwrap();
        assert_eq!(next.id, 2);
        assert!(restored.is_in_scope(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }
}
