//! Encrypted append-only record store
//!
//! A store is a single file holding a forward-linked chain of encrypted,
//! length-prefixed records. The file starts with a fixed 65-byte header that
//! is rewritten after every append; each record is a 29-byte node header
//! followed by its ciphertext. Nodes link forward and backward by raw file
//! offset, with `-1` marking the beginning of the chain and `-2` the end.
//! Offsets are opaque handles to callers.
//!
//! All fields are little-endian and fixed width, so a store file written by
//! one build is readable by any other.
//!
//! One `Mutex` guards the whole handle: appends (a read-modify-write of the
//! previous last node plus the header rewrite) are serialized, and every
//! iteration runs under the same lock so it sees a consistent snapshot.
//! Visitor closures must not call back into the same store.

use crate::crypto::{AesGcmCipher, RecordCipher};
use crate::error::{ChainError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Sentinel offset: no previous node.
pub const BOF: i64 = -1;
/// Sentinel offset: no next node.
pub const EOF: i64 = -2;

pub const CURRENT_STORE_VERSION: u8 = 1;

const HEADER_LEN: usize = 65;
const NODE_HEADER_LEN: usize = 29;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StoreHeader {
    version: u8,
    first_node_position: i64,
    last_node_position: i64,
    node_count: i64,
    total_encrypted_length: i64,
    /// Reserved; written as zeros.
    integrity_hash: [u8; 32],
}

impl StoreHeader {
    fn new() -> Self {
        StoreHeader {
            version: CURRENT_STORE_VERSION,
            first_node_position: HEADER_LEN as i64,
            last_node_position: HEADER_LEN as i64,
            node_count: 0,
            total_encrypted_length: 0,
            integrity_hash: [0u8; 32],
        }
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.version;
        buf[1..9].copy_from_slice(&self.first_node_position.to_le_bytes());
        buf[9..17].copy_from_slice(&self.last_node_position.to_le_bytes());
        buf[17..25].copy_from_slice(&self.node_count.to_le_bytes());
        buf[25..33].copy_from_slice(&self.total_encrypted_length.to_le_bytes());
        buf[33..65].copy_from_slice(&self.integrity_hash);
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let version = buf[0];
        if version != CURRENT_STORE_VERSION {
            return Err(ChainError::Format(format!(
                "Unsupported store version {}",
                version
            )));
        }
        let mut integrity_hash = [0u8; 32];
        integrity_hash.copy_from_slice(&buf[33..65]);
        Ok(StoreHeader {
            version,
            first_node_position: read_i64(buf, 1),
            last_node_position: read_i64(buf, 9),
            node_count: read_i64(buf, 17),
            total_encrypted_length: read_i64(buf, 25),
            integrity_hash,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct NodeHeader {
    position: i64,
    previous: i64,
    next: i64,
    deleted: bool,
    data_length: i32,
}

impl NodeHeader {
    fn encode(&self) -> [u8; NODE_HEADER_LEN] {
        let mut buf = [0u8; NODE_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.position.to_le_bytes());
        buf[8..16].copy_from_slice(&self.previous.to_le_bytes());
        buf[16..24].copy_from_slice(&self.next.to_le_bytes());
        buf[24] = self.deleted as u8;
        buf[25..29].copy_from_slice(&self.data_length.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; NODE_HEADER_LEN]) -> Result<Self> {
        let data_length = i32::from_le_bytes([buf[25], buf[26], buf[27], buf[28]]);
        if data_length < 0 {
            return Err(ChainError::Format(format!(
                "Negative node data length {}",
                data_length
            )));
        }
        Ok(NodeHeader {
            position: read_i64(buf, 0),
            previous: read_i64(buf, 8),
            next: read_i64(buf, 16),
            deleted: buf[24] != 0,
            data_length,
        })
    }
}

fn read_i64(buf: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_le_bytes(bytes)
}

struct StoreInner {
    file: File,
    header: StoreHeader,
    /// Offset of the next node the cursor will read; BOF/EOF at the edges.
    cursor: i64,
    closed: bool,
}

/// Handle to one open store file.
pub struct RecordStore {
    path: PathBuf,
    cipher: Box<dyn RecordCipher>,
    inner: Mutex<StoreInner>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Opens (creating if necessary) the store at `path` with the default
    /// record cipher.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_cipher(path, Box::new(AesGcmCipher::new()))
    }

    /// Opens the store with a caller-supplied cipher. A fresh file gets a new
    /// header; an existing file must carry a parseable one.
    pub fn open_with_cipher(path: impl AsRef<Path>, cipher: Box<dyn RecordCipher>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let size = file.metadata()?.len();
        let header = if size == 0 {
            let header = StoreHeader::new();
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header.encode())?;
            header
        } else {
            if size < HEADER_LEN as u64 {
                return Err(ChainError::Format(format!(
                    "Store file is {} bytes, shorter than its header",
                    size
                )));
            }
            let mut buf = [0u8; HEADER_LEN];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            StoreHeader::decode(&buf)?
        };

        let cursor = if header.node_count > 0 {
            header.first_node_position
        } else {
            EOF
        };

        Ok(RecordStore {
            path,
            cipher,
            inner: Mutex::new(StoreInner {
                file,
                header,
                cursor,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        !self.inner.lock().closed
    }

    /// Marks the handle closed; every later operation fails with `Closed`.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ChainError::Closed);
        }
        inner.file.sync_all()?;
        inner.closed = true;
        Ok(())
    }

    pub fn count(&self) -> i64 {
        self.inner.lock().header.node_count
    }

    pub fn total_encrypted_length(&self) -> i64 {
        self.inner.lock().header.total_encrypted_length
    }

    /// Offset of the first node; an opaque handle for `read_from`.
    pub fn first_node_position(&self) -> i64 {
        self.inner.lock().header.first_node_position
    }

    /// Offset of the most recently appended node.
    pub fn last_node_position(&self) -> i64 {
        self.inner.lock().header.last_node_position
    }

    /// Encrypts `payload` and links it after the current last node. The whole
    /// read-modify-write (previous node's forward link, the new node, the
    /// header) runs under the handle lock.
    pub fn append(&self, payload: &[u8]) -> Result<()> {
        let ciphertext = self.cipher.encrypt(payload)?;
        if ciphertext.len() > i32::MAX as usize {
            return Err(ChainError::InvalidInput(format!(
                "Payload of {} encrypted bytes exceeds the record size limit",
                ciphertext.len()
            )));
        }

        let mut inner = self.inner.lock();
        ensure_open(&inner)?;

        let new_position = inner.file.seek(SeekFrom::End(0))? as i64;

        let previous = if inner.header.node_count > 0 {
            let last_position = inner.header.last_node_position;
            let mut last = read_node_header(&mut inner, last_position)?;
            last.next = new_position;
            write_node_header(&mut inner, &last)?;
            last_position
        } else {
            BOF
        };

        let node = NodeHeader {
            position: new_position,
            previous,
            next: EOF,
            deleted: false,
            data_length: ciphertext.len() as i32,
        };

        inner.file.seek(SeekFrom::Start(new_position as u64))?;
        inner.file.write_all(&node.encode())?;
        inner.file.write_all(&ciphertext)?;

        inner.header.last_node_position = new_position;
        inner.header.node_count += 1;
        inner.header.total_encrypted_length += ciphertext.len() as i64;
        write_header(&mut inner)?;

        if inner.cursor == EOF && inner.header.node_count == 1 {
            inner.cursor = inner.header.first_node_position;
        }

        Ok(())
    }

    /// Positions the cursor on the first record.
    pub fn rewind(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        if inner.header.node_count == 0 {
            return Err(ChainError::Empty);
        }
        inner.cursor = inner.header.first_node_position;
        Ok(())
    }

    /// Decrypts and returns the record under the cursor, then advances the
    /// cursor along the node's forward link. `EndOfChain` past the last
    /// record, `BeginningOfChain` before the first, `Empty` on a fresh store.
    pub fn next_record(&self) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        if inner.header.node_count == 0 {
            return Err(ChainError::Empty);
        }
        let position = inner.cursor;
        let (node, plaintext) = self.read_record(&mut inner, position)?;
        inner.cursor = node.next;
        Ok(plaintext)
    }

    /// Repositions the cursor on an opaque node handle and reads from there.
    pub fn read_from(&self, position: i64) -> Result<Vec<u8>> {
        {
            let mut inner = self.inner.lock();
            ensure_open(&inner)?;
            inner.cursor = position;
        }
        self.next_record()
    }

    /// Visits every record from first to last. Decryption failures abort the
    /// iteration; the error carries on to the caller.
    pub fn for_each(&self, mut visit: impl FnMut(&[u8])) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        if inner.header.node_count == 0 {
            return Ok(());
        }

        let mut position = inner.header.first_node_position;
        while position != EOF {
            let (node, plaintext) = self.read_record(&mut inner, position)?;
            visit(&plaintext);
            position = node.next;
        }
        Ok(())
    }

    /// Returns the first non-`None` value the predicate produces, scanning in
    /// append order. `NotFound` when nothing matches (including an empty
    /// store).
    pub fn find_first<T>(&self, predicate: impl Fn(&[u8]) -> Option<T>) -> Result<T> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;

        let mut position = if inner.header.node_count == 0 {
            EOF
        } else {
            inner.header.first_node_position
        };
        while position != EOF {
            let (node, plaintext) = self.read_record(&mut inner, position)?;
            if let Some(found) = predicate(&plaintext) {
                return Ok(found);
            }
            position = node.next;
        }
        Err(ChainError::NotFound)
    }

    /// Overwrites the payload of the first record matching `predicate`.
    /// The replacement ciphertext must fit in the record's existing span;
    /// `PayloadTooLarge` otherwise, `NotFound` when nothing matches.
    pub fn update_matching(
        &self,
        new_payload: &[u8],
        predicate: impl Fn(&[u8]) -> bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;

        let mut position = if inner.header.node_count == 0 {
            EOF
        } else {
            inner.header.first_node_position
        };
        while position != EOF {
            let (mut node, plaintext) = self.read_record(&mut inner, position)?;
            if predicate(&plaintext) {
                let ciphertext = self.cipher.encrypt(new_payload)?;
                if ciphertext.len() > node.data_length as usize {
                    return Err(ChainError::PayloadTooLarge {
                        existing: node.data_length as usize,
                        requested: ciphertext.len(),
                    });
                }
                // Shrinking the recorded length keeps the record readable;
                // the node span itself never moves.
                node.data_length = ciphertext.len() as i32;
                write_node_header(&mut inner, &node)?;
                inner
                    .file
                    .seek(SeekFrom::Start(node.position as u64 + NODE_HEADER_LEN as u64))?;
                inner.file.write_all(&ciphertext)?;
                return Ok(());
            }
            position = node.next;
        }
        Err(ChainError::NotFound)
    }

    fn read_record(&self, inner: &mut StoreInner, position: i64) -> Result<(NodeHeader, Vec<u8>)> {
        if position == BOF {
            return Err(ChainError::BeginningOfChain);
        }
        if position == EOF {
            return Err(ChainError::EndOfChain);
        }

        let node = read_node_header(inner, position)?;
        let mut ciphertext = vec![0u8; node.data_length as usize];
        read_exact(&mut inner.file, &mut ciphertext)?;
        let plaintext = self.cipher.decrypt(&ciphertext)?;
        Ok((node, plaintext))
    }
}

fn ensure_open(inner: &StoreInner) -> Result<()> {
    if inner.closed {
        return Err(ChainError::Closed);
    }
    Ok(())
}

fn read_node_header(inner: &mut StoreInner, position: i64) -> Result<NodeHeader> {
    if position < HEADER_LEN as i64 {
        return Err(ChainError::Format(format!(
            "Node offset {} points inside the store header",
            position
        )));
    }
    inner.file.seek(SeekFrom::Start(position as u64))?;
    let mut buf = [0u8; NODE_HEADER_LEN];
    read_exact(&mut inner.file, &mut buf)?;
    NodeHeader::decode(&buf)
}

fn write_node_header(inner: &mut StoreInner, node: &NodeHeader) -> Result<()> {
    inner.file.seek(SeekFrom::Start(node.position as u64))?;
    inner.file.write_all(&node.encode())?;
    Ok(())
}

fn write_header(inner: &mut StoreInner) -> Result<()> {
    let encoded = inner.header.encode();
    inner.file.seek(SeekFrom::Start(0))?;
    inner.file.write_all(&encoded)?;
    Ok(())
}

fn read_exact(file: &mut File, buf: &mut [u8]) -> Result<()> {
    file.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ChainError::Format("Store file is truncated".to_string())
        } else {
            ChainError::Io(e.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RecordStore) {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path().join("test.dat")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_fresh_store_writes_header() {
        let (dir, store) = open_temp();
        assert_eq!(store.count(), 0);
        drop(store);

        let bytes = std::fs::read(dir.path().join("test.dat")).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes[0], CURRENT_STORE_VERSION);
        // first and last node positions both point at the end of the header
        assert_eq!(read_i64(&bytes, 1), HEADER_LEN as i64);
        assert_eq!(read_i64(&bytes, 9), HEADER_LEN as i64);
        assert_eq!(read_i64(&bytes, 17), 0);
    }

    #[test]
    fn test_append_links_nodes_and_rewrites_header() {
        let (dir, store) = open_temp();
        store.append(b"x").unwrap();
        store.append(b"y").unwrap();
        assert_eq!(store.count(), 2);
        // each 1-byte payload seals to 17 ciphertext bytes (16-byte GCM tag)
        assert_eq!(store.total_encrypted_length(), 34);

        let first = HEADER_LEN as i64;
        let second = first + NODE_HEADER_LEN as i64 + 17;
        assert_eq!(store.first_node_position(), first);
        assert_eq!(store.last_node_position(), second);

        let bytes = std::fs::read(dir.path().join("test.dat")).unwrap();
        assert_eq!(read_i64(&bytes, 9), second);

        let node1 = NodeHeader::decode(
            bytes[first as usize..first as usize + NODE_HEADER_LEN]
                .try_into()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(node1.position, first);
        assert_eq!(node1.previous, BOF);
        assert_eq!(node1.next, second);
        assert_eq!(node1.data_length, 17);

        let node2 = NodeHeader::decode(
            bytes[second as usize..second as usize + NODE_HEADER_LEN]
                .try_into()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(node2.previous, first);
        assert_eq!(node2.next, EOF);
    }

    #[test]
    fn test_cursor_traversal_sentinels() {
        let (_dir, store) = open_temp();
        assert_eq!(store.rewind().unwrap_err(), ChainError::Empty);
        assert_eq!(store.next_record().unwrap_err(), ChainError::Empty);

        store.append(b"first").unwrap();
        store.append(b"second").unwrap();

        store.rewind().unwrap();
        assert_eq!(store.next_record().unwrap(), b"first");
        assert_eq!(store.next_record().unwrap(), b"second");
        assert_eq!(store.next_record().unwrap_err(), ChainError::EndOfChain);

        assert_eq!(
            store.read_from(BOF).unwrap_err(),
            ChainError::BeginningOfChain
        );
        let first = store.first_node_position();
        assert_eq!(store.read_from(first).unwrap(), b"first");
    }

    #[test]
    fn test_for_each_yields_append_order() {
        let (_dir, store) = open_temp();
        for payload in [&b"a"[..], b"bb", b"ccc"] {
            store.append(payload).unwrap();
        }

        let mut seen = Vec::new();
        store.for_each(|data| seen.push(data.to_vec())).unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);

        // empty store: zero visits, no error
        let (_dir2, empty) = open_temp();
        let mut visits = 0;
        empty.for_each(|_| visits += 1).unwrap();
        assert_eq!(visits, 0);
    }

    #[test]
    fn test_find_first_returns_predicate_value() {
        let (_dir, store) = open_temp();
        store.append(b"alpha").unwrap();
        store.append(b"beta").unwrap();

        let found = store
            .find_first(|data| {
                if data.starts_with(b"be") {
                    Some(data.len())
                } else {
                    None
                }
            })
            .unwrap();
        assert_eq!(found, 4);

        let missing = store.find_first(|_| None::<()>);
        assert_eq!(missing.unwrap_err(), ChainError::NotFound);
    }

    #[test]
    fn test_update_matching_in_place() {
        let (_dir, store) = open_temp();
        store.append(b"keep").unwrap();
        store.append(b"swap").unwrap();
        store.append(b"keep2").unwrap();

        store
            .update_matching(b"SWAP", |data| data == b"swap")
            .unwrap();

        let mut seen = Vec::new();
        store.for_each(|data| seen.push(data.to_vec())).unwrap();
        assert_eq!(
            seen,
            vec![b"keep".to_vec(), b"SWAP".to_vec(), b"keep2".to_vec()]
        );
        assert_eq!(store.count(), 3);
    }

    #[test]
    fn test_update_matching_shrinking_payload() {
        let (_dir, store) = open_temp();
        store.append(b"a longer payload").unwrap();
        store.update_matching(b"tiny", |_| true).unwrap();

        let mut seen = Vec::new();
        store.for_each(|data| seen.push(data.to_vec())).unwrap();
        assert_eq!(seen, vec![b"tiny".to_vec()]);
    }

    #[test]
    fn test_update_matching_rejects_growth() {
        let (_dir, store) = open_temp();
        store.append(b"short").unwrap();

        let err = store
            .update_matching(b"definitely much longer than before", |_| true)
            .unwrap_err();
        assert!(matches!(err, ChainError::PayloadTooLarge { .. }));

        // the record is untouched
        let mut seen = Vec::new();
        store.for_each(|data| seen.push(data.to_vec())).unwrap();
        assert_eq!(seen, vec![b"short".to_vec()]);

        let err = store.update_matching(b"x", |_| false).unwrap_err();
        assert_eq!(err, ChainError::NotFound);
    }

    #[test]
    fn test_corrupted_payload_aborts_read() {
        let (dir, store) = open_temp();
        store.append(b"will be damaged").unwrap();
        drop(store);

        let path = dir.path().join("test.dat");
        let mut bytes = std::fs::read(&path).unwrap();
        let payload_start = HEADER_LEN + NODE_HEADER_LEN;
        bytes[payload_start] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let store = RecordStore::open(&path).unwrap();
        let err = store.for_each(|_| {}).unwrap_err();
        assert!(matches!(err, ChainError::Decryption(_)));
    }

    #[test]
    fn test_close_rejects_later_operations() {
        let (_dir, store) = open_temp();
        store.append(b"x").unwrap();
        store.close().unwrap();

        assert!(!store.is_open());
        assert_eq!(store.append(b"y").unwrap_err(), ChainError::Closed);
        assert_eq!(store.rewind().unwrap_err(), ChainError::Closed);
        assert_eq!(store.close().unwrap_err(), ChainError::Closed);
    }

    #[test]
    fn test_open_rejects_garbage_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.dat");
        std::fs::write(&path, [0xABu8; 20]).unwrap();
        assert!(matches!(
            RecordStore::open(&path).unwrap_err(),
            ChainError::Format(_)
        ));

        let mut versioned = vec![0u8; HEADER_LEN];
        versioned[0] = 99;
        std::fs::write(&path, &versioned).unwrap();
        assert!(matches!(
            RecordStore::open(&path).unwrap_err(),
            ChainError::Format(_)
        ));
    }
}
