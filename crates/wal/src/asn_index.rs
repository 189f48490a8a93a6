//! Per-stream ASN index: an ordered map from application sequence number to
//! its current version, disposition, and LSN.

use std::collections::BTreeMap;

use durlog_common::{Asn, Disposition, Lsn, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsnQueryKind {
    Exact,
    Next,
    Prev,
    Containing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsnEntry {
    pub version: Version,
    pub disposition: Disposition,
    pub lsn: Lsn,
    pub payload_size_hint: u32,
}

#[derive(Debug, Default)]
pub struct AsnIndex {
    entries: BTreeMap<Asn, AsnEntry>,
}

impl AsnIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically insert or replace the entry at `asn`. Fails with
    /// `Err(current_version)` when the existing entry's version is strictly
    /// greater than `version`. Returns the prior entry (if any) so the
    /// caller can roll back if a later pipeline stage aborts.
    pub fn add_or_update(
        &mut self,
        asn: Asn,
        version: Version,
        payload_size_hint: u32,
    ) -> Result<Option<AsnEntry>, Version> {
        if let Some(existing) = self.entries.get(&asn) {
            if existing.version > version {
                return Err(existing.version);
            }
        }
        let prior = self.entries.insert(
            asn,
            AsnEntry {
                version,
                disposition: Disposition::Pending,
                lsn: durlog_common::NULL_LSN,
                payload_size_hint,
            },
        );
        Ok(prior)
    }

    /// Restore a previously displaced entry (pipeline rollback), or remove
    /// the slot entirely if there was none.
    pub fn restore(&mut self, asn: Asn, prior: Option<AsnEntry>) {
        match prior {
            Some(entry) => {
                self.entries.insert(asn, entry);
            }
            None => {
                self.entries.remove(&asn);
            }
        }
    }

    /// No-op, returns false, iff the current version does not match
    /// `version` (a newer writer raced ahead).
    pub fn update_lsn_and_disposition(
        &mut self,
        asn: Asn,
        version: Version,
        disposition: Disposition,
        lsn: Lsn,
    ) -> bool {
        match self.entries.get_mut(&asn) {
            Some(e) if e.version == version => {
                e.disposition = disposition;
                e.lsn = lsn;
                true
            }
            _ => false,
        }
    }

    pub fn set_disposition(&mut self, asn: Asn, version: Version, disposition: Disposition) -> bool {
        match self.entries.get_mut(&asn) {
            Some(e) if e.version == version => {
                e.disposition = disposition;
                true
            }
            _ => false,
        }
    }

    /// Remove the entry iff its current version equals `version`.
    pub fn try_remove(&mut self, asn: Asn, version: Version) -> bool {
        match self.entries.get(&asn) {
            Some(e) if e.version == version => {
                self.entries.remove(&asn);
                true
            }
            _ => false,
        }
    }

    /// Remove for a delete operation, additionally reporting the minimal LSN
    /// truncation point the removal unblocks (the lowest LSN among the
    /// remaining entries, or `None` if the index is now empty).
    pub fn try_remove_for_delete(&mut self, asn: Asn, version: Version) -> (bool, Option<Lsn>) {
        let removed = self.try_remove(asn, version);
        if !removed {
            return (false, None);
        }
        (true, self.entries.values().map(|e| e.lsn).min())
    }

    pub fn query(&self, asn: Asn, kind: AsnQueryKind) -> Option<(Asn, AsnEntry)> {
        match kind {
            AsnQueryKind::Exact => self.entries.get(&asn).map(|e| (asn, e.clone())),
            AsnQueryKind::Containing => self
                .entries
                .range(..=asn)
                .next_back()
                .map(|(k, v)| (*k, v.clone())),
            AsnQueryKind::Next => self
                .entries
                .range(asn + 1..)
                .next()
                .map(|(k, v)| (*k, v.clone())),
            AsnQueryKind::Prev => self
                .entries
                .range(..asn)
                .next_back()
                .map(|(k, v)| (*k, v.clone())),
        }
    }

    pub fn range(&self, low: Asn, high: Asn) -> Vec<(Asn, AsnEntry)> {
        self.entries
            .range(low..=high)
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    /// Minimum LSN among entries with ASN strictly greater than `reference`,
    /// or `fallback` if none exist. Used by truncation to find the floor an
    /// ASN's removal must not cross.
    pub fn lowest_lsn_of_higher_asns(&self, reference: Asn, fallback: Lsn) -> Lsn {
        self.entries
            .range(reference + 1..)
            .map(|(_, v)| v.lsn)
            .min()
            .unwrap_or(fallback)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Asn, &AsnEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_version_is_rejected() {
        let mut idx = AsnIndex::new();
        idx.add_or_update(7, 5, 16).unwrap();
        idx.update_lsn_and_disposition(7, 5, Disposition::Persisted, 0);
        let err = idx.add_or_update(7, 3, 16).unwrap_err();
        assert_eq!(err, 5);
        let (_, entry) = idx.query(7, AsnQueryKind::Exact).unwrap();
        assert_eq!(entry.version, 5);
        assert_eq!(entry.disposition, Disposition::Persisted);
    }

    #[test]
    fn racing_writer_update_is_rejected() {
        let mut idx = AsnIndex::new();
        idx.add_or_update(1, 1, 0).unwrap();
        idx.add_or_update(1, 2, 0).unwrap();
        // The version-1 writer's completion callback races behind version 2.
        assert!(!idx.update_lsn_and_disposition(1, 1, Disposition::Persisted, 10));
        assert!(idx.update_lsn_and_disposition(1, 2, Disposition::Persisted, 11));
    }

    #[test]
    fn lowest_lsn_of_higher_asns_reports_fallback_when_empty() {
        let idx = AsnIndex::new();
        assert_eq!(idx.lowest_lsn_of_higher_asns(0, 99), 99);
    }

    #[test]
    fn query_kinds_behave() {
        let mut idx = AsnIndex::new();
        for asn in [10u64, 20, 30] {
            idx.add_or_update(asn, 1, 0).unwrap();
        }
        assert_eq!(idx.query(20, AsnQueryKind::Exact).unwrap().0, 20);
        assert_eq!(idx.query(25, AsnQueryKind::Next).unwrap().0, 30);
        assert_eq!(idx.query(25, AsnQueryKind::Prev).unwrap().0, 20);
        assert_eq!(idx.query(25, AsnQueryKind::Containing).unwrap().0, 20);
        assert!(idx.query(5, AsnQueryKind::Containing).is_none());
    }
}
