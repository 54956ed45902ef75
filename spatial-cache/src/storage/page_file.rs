//! Raw page I/O for the paged storage.
//!
//! File layout:
//! - page 0: [`FileHeader`], padded to the page size
//! - pages `1..=high_water_mark`: one node each, wrapped in a
//!   [`PageWithChecksum`] and padded to the page size
//! - trailer at `(high_water_mark + 1) * page_size`: the free-page stack
//!
//! Every read and write touches exactly one page; nothing is preloaded.
//! All records are encoded with bincode's legacy configuration.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::IndexConfig;
use crate::constants::{HEADER_PAGE, MAGIC, MIN_PAGE_SIZE, VERSION};
use crate::node::Node;
use crate::types::{IndexMeta, NodeId, StorageError, StorageResult};

fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::legacy())
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
        .map(|(value, _)| value)
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

// ============================================================================
// On-disk records
// ============================================================================

/// Contents of page 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    /// Dimension, node capacities and split policy of an R-tree; `None` for
    /// files holding quadtree or grid nodes.
    pub layout: Option<IndexConfig>,
    /// Root, entry count and height.
    pub meta: IndexMeta,
    pub high_water_mark: u64,
    pub free_stack_len: u64,
}

impl FileHeader {
    pub fn new(page_size: usize) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            page_size: page_size as u32,
            layout: None,
            meta: IndexMeta::default(),
            high_water_mark: 0,
            free_stack_len: 0,
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.magic != MAGIC {
            return Err(StorageError::Corrupted {
                page: HEADER_PAGE,
                reason: format!("bad magic {:#010x}", self.magic),
            });
        }
        if self.version != VERSION {
            return Err(StorageError::Corrupted {
                page: HEADER_PAGE,
                reason: format!("unsupported format version {}", self.version),
            });
        }
        if (self.page_size as usize) < MIN_PAGE_SIZE {
            return Err(StorageError::Corrupted {
                page: HEADER_PAGE,
                reason: format!("page size {} below minimum", self.page_size),
            });
        }
        Ok(())
    }
}

/// A node page with a CRC32 over its encoded body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageWithChecksum {
    pub checksum: u32,
    pub body: Vec<u8>,
}

impl PageWithChecksum {
    pub fn new(node: &Node) -> StorageResult<Self> {
        let body = encode(node)?;
        Ok(Self {
            checksum: crc32fast::hash(&body),
            body,
        })
    }

    /// Verifies the checksum and decodes the node.
    pub fn into_node(self, page: NodeId) -> StorageResult<Node> {
        if self.body.is_empty() {
            return Err(StorageError::Corrupted {
                page,
                reason: "empty page".into(),
            });
        }
        let actual = crc32fast::hash(&self.body);
        if actual != self.checksum {
            return Err(StorageError::Corrupted {
                page,
                reason: format!(
                    "checksum mismatch (stored {:#010x}, computed {:#010x})",
                    self.checksum, actual
                ),
            });
        }
        decode(&self.body)
    }
}

/// Bytes `node` takes on its page before padding.
pub fn encoded_page_len(node: &Node) -> StorageResult<usize> {
    Ok(encode(&PageWithChecksum::new(node)?)?.len())
}

// ============================================================================
// Page file
// ============================================================================

/// Direct page access to one index file.
pub struct PageFile {
    file: File,
    path: PathBuf,
    page_size: usize,
}

impl PageFile {
    /// Creates (or truncates) the file at `path`.
    pub fn create(path: &Path, page_size: usize) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
        })
    }

    /// Opens an existing file, taking the page size from its header.
    pub fn open(path: &Path) -> StorageResult<(Self, FileHeader)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut buffer = vec![0u8; MIN_PAGE_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buffer)?;
        let header: FileHeader = decode(&buffer)?;
        header.validate()?;

        let page_file = Self {
            file,
            path: path.to_path_buf(),
            page_size: header.page_size as usize,
        };
        Ok((page_file, header))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn read_header(&mut self) -> StorageResult<FileHeader> {
        let buffer = self.read_raw(HEADER_PAGE)?;
        let header: FileHeader = decode(&buffer)?;
        header.validate()?;
        Ok(header)
    }

    pub fn write_header(&mut self, header: &FileHeader) -> StorageResult<()> {
        let bytes = encode(header)?;
        self.write_padded(HEADER_PAGE, bytes)
    }

    /// Reads and verifies the node stored on page `id`.
    pub fn read_page(&mut self, id: NodeId) -> StorageResult<Node> {
        Self::check_node_page(id)?;
        let buffer = self.read_raw(id)?;
        let page: PageWithChecksum = decode(&buffer)?;
        page.into_node(id)
    }

    pub fn write_page(&mut self, id: NodeId, node: &Node) -> StorageResult<()> {
        Self::check_node_page(id)?;
        let bytes = encode(&PageWithChecksum::new(node)?)?;
        self.write_padded(id, bytes)
    }

    /// Writes the free-page stack after the last page slot and truncates the
    /// file behind it.
    pub fn write_free_stack(&mut self, high_water_mark: u64, stack: &[NodeId]) -> StorageResult<()> {
        let bytes = encode(&stack)?;
        let offset = self.offset(high_water_mark + 1);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&bytes)?;
        self.file.set_len(offset + bytes.len() as u64)?;
        Ok(())
    }

    pub fn read_free_stack(&mut self, high_water_mark: u64, expected_len: u64) -> StorageResult<Vec<NodeId>> {
        let offset = self.offset(high_water_mark + 1);
        self.file.seek(SeekFrom::Start(offset))?;
        let mut bytes = Vec::new();
        self.file.read_to_end(&mut bytes)?;
        let stack: Vec<NodeId> = decode(&bytes)?;
        if stack.len() as u64 != expected_len {
            return Err(StorageError::Corrupted {
                page: high_water_mark + 1,
                reason: format!(
                    "free-page stack holds {} ids, header expects {}",
                    stack.len(),
                    expected_len
                ),
            });
        }
        Ok(stack)
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn offset(&self, page: NodeId) -> u64 {
        page * self.page_size as u64
    }

    fn check_node_page(id: NodeId) -> StorageResult<()> {
        if id == HEADER_PAGE {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "page 0 is reserved for the header",
            )));
        }
        Ok(())
    }

    fn read_raw(&mut self, page: NodeId) -> StorageResult<Vec<u8>> {
        let offset = self.offset(page);
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; self.page_size];
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn write_padded(&mut self, page: NodeId, mut bytes: Vec<u8>) -> StorageResult<()> {
        if bytes.len() > self.page_size {
            return Err(StorageError::PageOverflow {
                page,
                size: bytes.len(),
                max: self.page_size,
            });
        }
        bytes.resize(self.page_size, 0);
        let offset = self.offset(page);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::node::{TreeContents, TreeNode};
    use crate::region::Region;
    use tempfile::tempdir;

    fn leaf_with(n: u64) -> Node {
        let mut node = TreeNode::leaf(Some(3));
        node.id = 7;
        node.contents = TreeContents::Leaf(
            (0..n)
                .map(|i| Entry::new(Region::rect(i as f64, 0.0, i as f64 + 1.0, 1.0), i))
                .collect(),
        );
        node.recompute_bounds();
        Node::Tree(node)
    }

    #[test]
    fn test_header_round_trip_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.scix");
        let mut file = PageFile::create(&path, 1024).unwrap();

        let mut header = FileHeader::new(1024);
        header.layout = Some(IndexConfig::new(2, 4, 2));
        header.meta.root = Some(1);
        header.meta.entry_count = 12;
        header.high_water_mark = 5;
        file.write_header(&header).unwrap();
        assert_eq!(file.read_header().unwrap(), header);
        drop(file);

        let (reopened, read) = PageFile::open(&path).unwrap();
        assert_eq!(read, header);
        assert_eq!(reopened.page_size(), 1024);
    }

    #[test]
    fn test_page_round_trip() {
        let dir = tempdir().unwrap();
        let mut file = PageFile::create(&dir.path().join("index.scix"), 4096).unwrap();
        let node = leaf_with(5);
        file.write_page(2, &node).unwrap();
        assert_eq!(file.read_page(2).unwrap(), node);
    }

    #[test]
    fn test_page_zero_rejected() {
        let dir = tempdir().unwrap();
        let mut file = PageFile::create(&dir.path().join("index.scix"), 4096).unwrap();
        assert!(file.write_page(0, &leaf_with(1)).is_err());
        assert!(file.read_page(0).is_err());
    }

    #[test]
    fn test_oversized_node_rejected() {
        let dir = tempdir().unwrap();
        let mut file = PageFile::create(&dir.path().join("index.scix"), 512).unwrap();
        let err = file.write_page(1, &leaf_with(40)).unwrap_err();
        assert!(matches!(err, StorageError::PageOverflow { page: 1, max: 512, .. }));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut page = PageWithChecksum::new(&leaf_with(2)).unwrap();
        page.body[4] ^= 0xFF;
        let err = page.into_node(9).unwrap_err();
        assert!(matches!(err, StorageError::Corrupted { page: 9, .. }));
    }

    #[test]
    fn test_zeroed_page_is_corrupted() {
        let dir = tempdir().unwrap();
        let mut file = PageFile::create(&dir.path().join("index.scix"), 1024).unwrap();
        file.write_page(2, &leaf_with(1)).unwrap();
        // page 1 was never written and reads back as zeros
        assert!(matches!(
            file.read_page(1),
            Err(StorageError::Corrupted { page: 1, .. })
        ));
    }

    #[test]
    fn test_free_stack_trailer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.scix");
        let mut file = PageFile::create(&path, 1024).unwrap();
        file.write_header(&FileHeader::new(1024)).unwrap();
        file.write_page(3, &leaf_with(1)).unwrap();

        file.write_free_stack(3, &[2, 1]).unwrap();
        assert_eq!(file.read_free_stack(3, 2).unwrap(), vec![2, 1]);
        assert!(file.read_free_stack(3, 5).is_err());

        // shrinking the high-water mark truncates the file behind the trailer
        file.write_free_stack(1, &[]).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        assert!(len < 3 * 1024);
        assert!(file.read_free_stack(1, 0).unwrap().is_empty());
    }
}
