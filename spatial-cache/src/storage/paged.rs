//! Disk-paged node table.
//!
//! Nodes live one per page in a [`PageFile`]. A bounded [`PageCache`] holds
//! recently used pages; dirty pages are written back when evicted and on
//! [`flush`](IndexStorage::flush). Released ids are kept on a free-page stack
//! that is persisted as a trailer behind the last page slot, so a reopened
//! file keeps reusing them.
//!
//! A dirty page whose write-back fails on eviction is not dropped: it stays
//! in memory as unwritten until a flush manages to write it, and reads of
//! that page keep seeing it. The failure is reported by that flush.
//!
//! Invariant: `live_nodes + free_pages == high_water_mark` at all times.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::page_cache::{CachedPage, PageCache};
use super::page_file::{FileHeader, PageFile};
use super::IndexStorage;
use crate::config::{IndexConfig, PagedOptions};
use crate::node::Node;
use crate::types::{IndexMeta, IndexResult, NodeId, StorageError, StorageResult, StorageStats};

/// Result of [`PagedStorage::check_integrity`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub pages_checked: u64,
    /// Live pages that failed to decode or verify.
    pub corrupted_pages: Vec<NodeId>,
    /// Live pages not reachable from the root.
    pub orphaned_pages: Vec<NodeId>,
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn is_valid(&self) -> bool {
        self.corrupted_pages.is_empty() && self.orphaned_pages.is_empty()
    }
}

#[derive(Debug, Default)]
struct Counters {
    cache_hits: u64,
    cache_misses: u64,
    disk_reads: u64,
    disk_writes: u64,
}

pub struct PagedStorage {
    file: PageFile,
    cache: PageCache,
    header: FileHeader,
    free_stack: Vec<NodeId>,
    free_set: HashSet<NodeId>,
    /// Evicted dirty pages that could not be written back.
    unwritten: HashMap<NodeId, Node>,
    /// Set by every change, cleared by a successful flush.
    modified: bool,
    force_flush: bool,
    counters: Counters,
}

impl PagedStorage {
    /// Creates a new file at `path`, replacing any existing one.
    pub fn create(path: impl AsRef<Path>, options: PagedOptions) -> IndexResult<Self> {
        options.validate()?;
        let path = path.as_ref();
        let mut file = PageFile::create(path, options.page_size)?;
        let header = FileHeader::new(options.page_size);
        file.write_header(&header)?;
        file.write_free_stack(0, &[])?;
        log::debug!("created paged storage at {}", path.display());

        Ok(Self {
            file,
            cache: PageCache::new(options.cache_pages),
            header,
            free_stack: Vec::new(),
            free_set: HashSet::new(),
            unwritten: HashMap::new(),
            modified: false,
            force_flush: options.force_flush,
            counters: Counters::default(),
        })
    }

    /// Opens a file written by a previous instance. The page size recorded
    /// in the file wins over `options.page_size`.
    pub fn open(path: impl AsRef<Path>, options: PagedOptions) -> IndexResult<Self> {
        options.validate()?;
        let path = path.as_ref();
        let (mut file, header) = PageFile::open(path)?;
        if file.page_size() != options.page_size {
            log::debug!(
                "using persisted page size {} instead of {}",
                file.page_size(),
                options.page_size
            );
        }
        let free_stack = file.read_free_stack(header.high_water_mark, header.free_stack_len)?;
        let free_set: HashSet<NodeId> = free_stack.iter().copied().collect();
        if free_set.len() != free_stack.len()
            || free_stack.iter().any(|&id| id == 0 || id > header.high_water_mark)
        {
            return Err(StorageError::Corrupted {
                page: header.high_water_mark + 1,
                reason: "free-page stack holds duplicate or out-of-range ids".into(),
            }
            .into());
        }
        log::debug!(
            "opened paged storage at {} ({} pages, {} free, {} entries)",
            path.display(),
            header.high_water_mark,
            free_stack.len(),
            header.meta.entry_count
        );

        Ok(Self {
            file,
            cache: PageCache::new(options.cache_pages),
            header,
            free_stack,
            free_set,
            unwritten: HashMap::new(),
            modified: false,
            force_flush: options.force_flush,
            counters: Counters::default(),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn page_size(&self) -> usize {
        self.file.page_size()
    }

    /// Pages held in memory because their write-back failed.
    pub fn unwritten_pages(&self) -> usize {
        self.unwritten.len()
    }

    /// Flushes, then reads every live page from disk and walks the tree from
    /// the root.
    pub fn check_integrity(&mut self) -> StorageResult<IntegrityReport> {
        self.flush()?;
        let mut report = IntegrityReport::default();
        let mut children_of = Vec::new();

        for id in 1..=self.header.high_water_mark {
            if self.free_set.contains(&id) {
                continue;
            }
            report.pages_checked += 1;
            self.counters.disk_reads += 1;
            match self.file.read_page(id) {
                Ok(node) if node.id() == id => children_of.push((id, node.children())),
                Ok(node) => {
                    report.corrupted_pages.push(id);
                    report.errors.push(format!("page {} holds node {}", id, node.id()));
                }
                Err(e) => {
                    report.corrupted_pages.push(id);
                    report.errors.push(e.to_string());
                }
            }
        }

        let mut reachable = HashSet::new();
        let mut stack: Vec<NodeId> = self.header.meta.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some((_, children)) = children_of.iter().find(|(page, _)| *page == id) {
                stack.extend(children.iter().copied());
            }
        }
        report.orphaned_pages = children_of
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| !reachable.contains(id))
            .collect();

        if !report.is_valid() {
            log::warn!(
                "integrity check found {} corrupted and {} orphaned pages",
                report.corrupted_pages.len(),
                report.orphaned_pages.len()
            );
        }
        Ok(report)
    }

    fn ensure_live(&self, id: NodeId) -> StorageResult<()> {
        if id == 0 || id > self.header.high_water_mark || self.free_set.contains(&id) {
            return Err(StorageError::NotFound(id));
        }
        Ok(())
    }

    /// Brings page `id` into the buffer.
    fn load(&mut self, id: NodeId) -> StorageResult<()> {
        if self.cache.contains(id) {
            self.counters.cache_hits += 1;
            return Ok(());
        }
        self.counters.cache_misses += 1;
        if let Some(node) = self.unwritten.remove(&id) {
            self.buffer(id, node, true);
            return Ok(());
        }
        self.counters.disk_reads += 1;
        let node = self.file.read_page(id)?;
        self.buffer(id, node, false);
        Ok(())
    }

    fn buffer(&mut self, id: NodeId, node: Node, dirty: bool) {
        if let Some((evicted, page)) = self.cache.insert(id, node, dirty) {
            self.write_back(evicted, page);
        }
    }

    /// Writes an evicted page out if it is dirty. On failure the page is
    /// kept as unwritten.
    fn write_back(&mut self, id: NodeId, page: CachedPage) {
        if !page.dirty {
            return;
        }
        log::trace!("writing back evicted page {}", id);
        match self.file.write_page(id, &page.node) {
            Ok(()) => self.counters.disk_writes += 1,
            Err(e) => {
                log::warn!("keeping page {} in memory, write-back failed: {}", id, e);
                self.unwritten.insert(id, page.node);
            }
        }
    }
}

impl IndexStorage for PagedStorage {
    fn allocate(&mut self, mut node: Node) -> StorageResult<NodeId> {
        let id = match self.free_stack.pop() {
            Some(id) => {
                self.free_set.remove(&id);
                log::trace!("reusing page {}", id);
                id
            }
            None => {
                self.header.high_water_mark += 1;
                self.header.high_water_mark
            }
        };
        node.set_id(id);
        self.modified = true;
        self.buffer(id, node, true);
        Ok(id)
    }

    fn get(&mut self, id: NodeId) -> StorageResult<&Node> {
        self.ensure_live(id)?;
        self.load(id)?;
        self.cache.get(id).ok_or(StorageError::NotFound(id))
    }

    fn get_mut(&mut self, id: NodeId) -> StorageResult<&mut Node> {
        self.ensure_live(id)?;
        self.load(id)?;
        self.modified = true;
        self.cache.get_mut(id).ok_or(StorageError::NotFound(id))
    }

    fn release(&mut self, id: NodeId) -> StorageResult<()> {
        self.ensure_live(id)?;
        self.cache.remove(id);
        self.unwritten.remove(&id);
        self.modified = true;
        self.free_stack.push(id);
        self.free_set.insert(id);
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        if !self.modified {
            return Ok(());
        }

        let mut stranded: Vec<NodeId> = self.unwritten.keys().copied().collect();
        stranded.sort_unstable();
        for id in stranded {
            if let Some(node) = self.unwritten.get(&id) {
                self.file.write_page(id, node)?;
                self.counters.disk_writes += 1;
            }
            self.unwritten.remove(&id);
        }

        let dirty = self.cache.dirty_pages();
        for id in &dirty {
            if let Some(page) = self.cache.peek(*id) {
                self.file.write_page(*id, &page.node)?;
                self.counters.disk_writes += 1;
            }
            self.cache.mark_clean(*id);
        }

        self.header.free_stack_len = self.free_stack.len() as u64;
        self.file
            .write_free_stack(self.header.high_water_mark, &self.free_stack)?;
        self.file.write_header(&self.header)?;
        self.file.sync()?;
        self.modified = false;
        log::debug!(
            "flushed {} dirty pages (high-water mark {}, {} free)",
            dirty.len(),
            self.header.high_water_mark,
            self.free_stack.len()
        );
        Ok(())
    }

    fn mutation_complete(&mut self) -> StorageResult<()> {
        if self.force_flush {
            self.flush()?;
        }
        Ok(())
    }

    fn reset(&mut self) -> StorageResult<()> {
        self.cache.clear();
        self.unwritten.clear();
        self.free_stack.clear();
        self.free_set.clear();
        self.modified = true;
        self.header.high_water_mark = 0;
        self.header.meta = IndexMeta::default();
        self.flush()
    }

    fn meta(&self) -> &IndexMeta {
        &self.header.meta
    }

    fn meta_mut(&mut self) -> &mut IndexMeta {
        self.modified = true;
        &mut self.header.meta
    }

    fn stats(&self) -> StorageStats {
        let free_pages = self.free_stack.len() as u64;
        StorageStats {
            live_nodes: self.header.high_water_mark - free_pages,
            free_pages,
            high_water_mark: self.header.high_water_mark,
            cached_pages: self.cache.len() as u64,
            cache_hits: self.counters.cache_hits,
            cache_misses: self.counters.cache_misses,
            disk_reads: self.counters.disk_reads,
            disk_writes: self.counters.disk_writes,
        }
    }

    fn layout(&self) -> Option<IndexConfig> {
        self.header.layout
    }

    fn record_layout(&mut self, layout: IndexConfig) {
        self.modified = true;
        self.header.layout = Some(layout);
    }

    fn page_capacity(&self) -> Option<usize> {
        Some(self.file.page_size())
    }

    fn is_live(&self, id: NodeId) -> bool {
        self.ensure_live(id).is_ok()
    }
}

impl Drop for PagedStorage {
    fn drop(&mut self) {
        if !self.modified {
            return;
        }
        if let Err(e) = self.flush() {
            log::warn!("failed to flush {} on drop: {}", self.path().display(), e);
        }
    }
}
