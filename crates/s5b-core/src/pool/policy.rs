//! Selection policies. Dispatch is a `match` on the configured rule; every
//! policy sees the same eligibility filter and exclusion set.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::time::Instant;

use s5b_config::SelectRule;

use super::{Backend, UpstreamPool};

impl UpstreamPool {
    /// Select a backend under the configured rule.
    ///
    /// Returns `None` iff no backend is eligible; the cursor is untouched in
    /// that case. The caller accounts the relay via [`Backend::acquire`] only
    /// once it actually starts using the backend.
    pub fn select(&self) -> Option<Arc<Backend>> {
        self.select_excluding(&HashSet::new())
    }

    /// Like [`select`](Self::select), additionally skipping `exclude`:
    /// backends a retrying session has already tried.
    pub fn select_excluding(&self, exclude: &HashSet<usize>) -> Option<Arc<Backend>> {
        if self.backends.is_empty() {
            return None;
        }
        if !self
            .backends
            .iter()
            .any(|b| b.eligible() && !exclude.contains(&b.index))
        {
            return None;
        }

        let idx = match self.rule {
            SelectRule::Loop => self.pick_loop(exclude),
            SelectRule::Random => self.pick_random(exclude),
            SelectRule::OneByOne => self.pick_one_by_one(exclude),
            SelectRule::ChangeByTime => self.pick_change_by_time(exclude),
            SelectRule::MinConnectCount => self.pick_min_connect_count(exclude),
        }?;
        Some(Arc::clone(&self.backends[idx]))
    }

    fn candidate(&self, idx: usize, exclude: &HashSet<usize>) -> bool {
        self.backends[idx].eligible() && !exclude.contains(&idx)
    }

    /// Scan from `start`, wrapping once around the pool.
    fn scan_from(&self, start: usize, exclude: &HashSet<usize>) -> Option<usize> {
        let n = self.backends.len();
        (0..n).map(|k| (start + k) % n).find(|&i| self.candidate(i, exclude))
    }

    fn pick_loop(&self, exclude: &HashSet<usize>) -> Option<usize> {
        let mut cursor = self.cursor.lock();
        let start = cursor.last_use.map_or(0, |i| (i + 1) % self.backends.len());
        let idx = self.scan_from(start, exclude)?;
        cursor.last_use = Some(idx);
        Some(idx)
    }

    fn pick_random(&self, exclude: &HashSet<usize>) -> Option<usize> {
        let candidates: Vec<usize> = (0..self.backends.len())
            .filter(|&i| self.candidate(i, exclude))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = candidates[fastrand::usize(0..candidates.len())];
        self.cursor.lock().last_use = Some(idx);
        Some(idx)
    }

    fn pick_one_by_one(&self, exclude: &HashSet<usize>) -> Option<usize> {
        let mut cursor = self.cursor.lock();
        if let Some(i) = cursor.last_use {
            if self.candidate(i, exclude) {
                return Some(i);
            }
        }
        let start = cursor
            .last_use
            .map_or(0, |i| (i + 1) % self.backends.len());
        let idx = self.scan_from(start, exclude)?;
        cursor.last_use = Some(idx);
        Some(idx)
    }

    fn pick_change_by_time(&self, exclude: &HashSet<usize>) -> Option<usize> {
        let mut cursor = self.cursor.lock();
        if let (Some(i), Some(t)) = (cursor.last_use, cursor.changed_at) {
            if t.elapsed() < self.change_every && self.candidate(i, exclude) {
                return Some(i);
            }
        }
        let start = cursor
            .last_use
            .map_or(0, |i| (i + 1) % self.backends.len());
        let idx = self.scan_from(start, exclude)?;
        cursor.last_use = Some(idx);
        cursor.changed_at = Some(Instant::now());
        Some(idx)
    }

    fn pick_min_connect_count(&self, exclude: &HashSet<usize>) -> Option<usize> {
        let idx = (0..self.backends.len())
            .filter(|&i| self.candidate(i, exclude))
            .min_by_key(|&i| (self.backends[i].connect_count(), i))?;
        self.cursor.lock().last_use = Some(idx);
        Some(idx)
    }
}
