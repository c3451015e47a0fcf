//! In-memory paged cache holding the client's view of one feed.

use tracing::trace;

use crate::record::{Record, RecordId};

/// One page of records as returned by the authority.
///
/// Records are ordered descending by `created_at`. The cursor is the
/// `created_at` of the last (oldest) record and fetches the next older page;
/// `None` means no older page exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    /// Records in this page, newest first.
    pub records: Vec<Record>,
    /// Cursor to the next older page, if any.
    pub next_cursor: Option<u64>,
}

/// The cached view of a single feed, organized into cursor-linked pages.
///
/// Pages concatenate to the full cache, newest page first. Across all pages
/// record ids are unique; a violation of that invariant is a programming
/// error, not a runtime failure, so all operations here are total.
#[derive(Debug, Clone, Default)]
pub struct PagedCache {
    pages: Vec<Page>,
}

impl PagedCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the first (newest) page, keeping older pages.
    ///
    /// Ids carried by the incoming page are removed from older pages so that
    /// cache-wide uniqueness holds.
    pub fn replace_first_page(&mut self, page: Page) {
        for record in &page.records {
            for older in self.pages.iter_mut().skip(1) {
                older.records.retain(|r| r.id != record.id);
            }
        }
        if self.pages.is_empty() {
            self.pages.push(page);
        } else {
            self.pages[0] = page;
        }
        self.debug_check();
    }

    /// Appends a page of older records at the end.
    ///
    /// Incoming records whose id is already cached are dropped.
    pub fn append_older_page(&mut self, mut page: Page) {
        page.records.retain(|r| self.get(&r.id).is_none());
        self.pages.push(page);
        self.debug_check();
    }

    /// Replaces an existing record with the same id, or inserts the record at
    /// the head of the first page.
    ///
    /// Never creates a second copy of an id.
    pub fn upsert(&mut self, record: Record) {
        for page in self.pages.iter_mut() {
            if let Some(slot) = page.records.iter_mut().find(|r| r.id == record.id) {
                *slot = record;
                return;
            }
        }
        if self.pages.is_empty() {
            self.pages.push(Page::default());
        }
        self.pages[0].records.insert(0, record);
        self.debug_check();
    }

    /// Removes the record with the given id wherever it resides.
    pub fn remove(&mut self, id: &RecordId) -> Option<Record> {
        for page in self.pages.iter_mut() {
            if let Some(pos) = page.records.iter().position(|r| r.id == *id) {
                return Some(page.records.remove(pos));
            }
        }
        None
    }

    /// Replaces the record stored under `id` with `record`, preserving its
    /// display position. The replacement may carry a different id (tentative
    /// to authoritative swap); any other copy of the new id is removed first.
    ///
    /// Returns false if `id` is not cached.
    pub fn replace_in_place(&mut self, id: &RecordId, record: Record) -> bool {
        if record.id != *id {
            self.remove(&record.id);
        }
        let pos = self.pages.iter().enumerate().find_map(|(pi, page)| {
            page.records
                .iter()
                .position(|r| r.id == *id)
                .map(|ri| (pi, ri))
        });
        let Some((pi, ri)) = pos else {
            return false;
        };
        trace!(old = %id.fmt_short(), new = %record.id.fmt_short(), "replace in place");
        self.pages[pi].records[ri] = record;
        self.debug_check();
        true
    }

    /// Re-inserts a record at its timestamp-sorted position.
    ///
    /// Used for rollback of an optimistic delete: the record returns to where
    /// the descending `created_at` order puts it, not to the head.
    pub fn restore(&mut self, record: Record) {
        self.remove(&record.id);
        if self.pages.is_empty() {
            self.pages.push(Page::default());
        }
        let pos = self.pages.iter().enumerate().find_map(|(pi, page)| {
            page.records
                .iter()
                .position(|r| r.created_at < record.created_at)
                .map(|ri| (pi, ri))
        });
        match pos {
            Some((pi, ri)) => self.pages[pi].records.insert(ri, record),
            None => self
                .pages
                .last_mut()
                .expect("pages is non-empty")
                .records
                .push(record),
        }
        self.debug_check();
    }

    /// The record stored under `id`, if any.
    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.iter().find(|r| r.id == *id)
    }

    /// Iterates all cached records, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.pages.iter().flat_map(|p| p.records.iter())
    }

    /// An owned snapshot of all records, ascending by `created_at` for
    /// display.
    pub fn snapshot(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self.iter().cloned().collect();
        records.reverse();
        records
    }

    /// Cursor for fetching the next older page, taken from the oldest loaded
    /// page. `None` if nothing is loaded or no older page exists.
    pub fn next_cursor(&self) -> Option<u64> {
        self.pages.last().and_then(|p| p.next_cursor)
    }

    /// Whether an older page can be fetched.
    pub fn has_older(&self) -> bool {
        self.next_cursor().is_some()
    }

    /// Number of cached records across all pages.
    pub fn len(&self) -> usize {
        self.pages.iter().map(|p| p.records.len()).sum()
    }

    /// True if no records are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all pages.
    pub fn clear(&mut self) {
        self.pages.clear();
    }

    #[cfg(debug_assertions)]
    fn debug_check(&self) {
        let mut seen = std::collections::HashSet::new();
        for record in self.iter() {
            debug_assert!(seen.insert(record.id), "duplicate id {}", record.id);
        }
    }

    #[cfg(not(debug_assertions))]
    fn debug_check(&self) {}
}
