//! Physical file layout shared by matrix and triple files.
//!
//! ```text
//! "GENOPACK" | u32 header_len | header
//! block*
//! directory: u32 n | (str name, u64 offset, u64 stored_len, u64 raw_len, u8 compressed)*
//! footer:    u64 directory_offset | "GPACKEND"
//! ```
//!
//! Integers are little-endian and strings are a `u32` length followed by
//! UTF-8 bytes. Blocks are zlib streams when compression is enabled.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use memmap2::Mmap;
use tracing::debug;

use crate::error::{CustomError, Result};

pub const MAGIC: &[u8; 8] = b"GENOPACK";
pub const FOOTER_MAGIC: &[u8; 8] = b"GPACKEND";
const FOOTER_SIZE: usize = 16;
const COMPRESSION_LEVEL: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub format: String,
    pub version: u32,
    pub compat_version: u32,
    /// "ldat"/"sdat" for matrices, "triple" for triple files.
    pub layout: String,
    pub compressed: bool,
}

impl Header {
    fn encode(&self) -> Vec<u8> {
        let mut buf = TableBuf::new();
        buf.put_str(&self.format);
        buf.put_u32(self.version);
        buf.put_u32(self.compat_version);
        buf.put_str(&self.layout);
        buf.put_u8(self.compressed as u8);
        buf.into_bytes()
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut cur = TableCursor::new("header", data);
        Ok(Self {
            format: cur.get_str()?,
            version: cur.get_u32()?,
            compat_version: cur.get_u32()?,
            layout: cur.get_str()?,
            compressed: cur.get_u8()? != 0,
        })
    }
}

/// Location of one stored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub offset: u64,
    pub stored_len: u64,
    pub raw_len: u64,
    pub compressed: bool,
}

impl BlockRef {
    fn put(&self, buf: &mut TableBuf) {
        buf.put_u64(self.offset);
        buf.put_u64(self.stored_len);
        buf.put_u64(self.raw_len);
        buf.put_u8(self.compressed as u8);
    }

    fn get(cur: &mut TableCursor<'_>) -> Result<Self> {
        Ok(Self {
            offset: cur.get_u64()?,
            stored_len: cur.get_u64()?,
            raw_len: cur.get_u64()?,
            compressed: cur.get_u8()? != 0,
        })
    }
}

/// A block of packed rows or triples and the number of records in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    pub block: BlockRef,
    pub n_records: usize,
}

pub fn encode_chunks(chunks: &[ChunkRecord]) -> Vec<u8> {
    let mut buf = TableBuf::new();
    buf.put_u64(chunks.len() as u64);
    for chunk in chunks {
        chunk.block.put(&mut buf);
        buf.put_u64(chunk.n_records as u64);
    }
    buf.into_bytes()
}

pub fn decode_chunks(data: &[u8]) -> Result<Vec<ChunkRecord>> {
    let mut cur = TableCursor::new("chunks", data);
    let n = cur.get_len()?;
    let mut chunks = Vec::with_capacity(n);
    for _ in 0..n {
        let block = BlockRef::get(&mut cur)?;
        let n_records = cur.get_u64()?;
        let n_records = usize::try_from(n_records)
            .map_err(|_| cur.corrupt(format!("record count {n_records} does not fit in memory")))?;
        chunks.push(ChunkRecord { block, n_records });
    }
    cur.finish()?;
    Ok(chunks)
}

pub fn encode_strings<S: AsRef<str>>(strings: &[S]) -> Vec<u8> {
    let mut buf = TableBuf::new();
    buf.put_u64(strings.len() as u64);
    for s in strings {
        buf.put_str(s.as_ref());
    }
    buf.into_bytes()
}

pub fn decode_strings(table: &str, data: &[u8]) -> Result<Vec<String>> {
    let mut cur = TableCursor::new(table, data);
    let n = cur.get_len()?;
    let mut strings = Vec::with_capacity(n);
    for _ in 0..n {
        strings.push(cur.get_str()?);
    }
    cur.finish()?;
    Ok(strings)
}

/// Little-endian table encoder.
#[derive(Debug, Default)]
pub struct TableBuf {
    data: Vec<u8>,
}

impl TableBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.data.extend_from_slice(s.as_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Little-endian table decoder; every short read is a corrupt table.
pub struct TableCursor<'a> {
    table: &'a str,
    data: &'a [u8],
    pos: usize,
}

impl<'a> TableCursor<'a> {
    pub fn new(table: &'a str, data: &'a [u8]) -> Self {
        Self {
            table,
            data,
            pos: 0,
        }
    }

    pub fn corrupt(&self, reason: impl Into<String>) -> CustomError {
        CustomError::CorruptTable {
            table: self.table.to_string(),
            reason: reason.into(),
        }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self
            .data
            .get(self.pos..self.pos + N)
            .ok_or_else(|| self.corrupt(format!("truncated at byte {}", self.pos)))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    /// A record count, checked against the bytes left so a corrupt count
    /// cannot trigger a huge allocation.
    pub fn get_len(&mut self) -> Result<usize> {
        let n = self.get_u64()?;
        if n > (self.data.len() - self.pos) as u64 {
            return Err(self.corrupt(format!("record count {n} exceeds table size")));
        }
        Ok(n as usize)
    }

    pub fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let bytes = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or_else(|| self.corrupt(format!("truncated string at byte {}", self.pos)))?;
        self.pos += len;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.corrupt("string is not valid UTF-8"))
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        if self.pos + n > self.data.len() {
            return Err(self.corrupt(format!("truncated at byte {}", self.pos)));
        }
        self.pos += n;
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn finish(&self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(self.corrupt(format!("{} trailing byte(s)", self.remaining())));
        }
        Ok(())
    }
}

/// Sequential writer for a new container file.
pub struct ContainerWriter {
    path: PathBuf,
    out: BufWriter<File>,
    position: u64,
    compress: bool,
    directory: Vec<(String, BlockRef)>,
}

impl ContainerWriter {
    pub fn create(path: impl AsRef<Path>, header: &Header) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| CustomError::Write {
            source: e,
            path: path.clone(),
        })?;
        let mut writer = Self {
            path,
            out: BufWriter::new(file),
            position: 0,
            compress: header.compressed,
            directory: Vec::new(),
        };
        let encoded = header.encode();
        writer.write_raw(MAGIC)?;
        writer.write_raw(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_raw(&encoded)?;
        debug!(path = %writer.path.display(), format = %header.format, "created container");
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes).map_err(|e| CustomError::Write {
            source: e,
            path: self.path.clone(),
        })?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Appends a block, compressing it when the container is compressed.
    pub fn write_block(&mut self, raw: &[u8]) -> Result<BlockRef> {
        let offset = self.position;
        if self.compress {
            let mut encoder =
                ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::new(COMPRESSION_LEVEL));
            let compressed = encoder
                .write_all(raw)
                .and_then(|_| encoder.finish())
                .map_err(|e| CustomError::Write {
                    source: e,
                    path: self.path.clone(),
                })?;
            self.write_raw(&compressed)?;
        } else {
            self.write_raw(raw)?;
        }
        Ok(BlockRef {
            offset,
            stored_len: self.position - offset,
            raw_len: raw.len() as u64,
            compressed: self.compress,
        })
    }

    /// Appends a block and records it in the directory under `name`.
    pub fn write_table(&mut self, name: &str, raw: &[u8]) -> Result<()> {
        let block = self.write_block(raw)?;
        self.directory.push((name.to_string(), block));
        Ok(())
    }

    /// Writes the directory and footer and flushes the file.
    pub fn finish(mut self) -> Result<()> {
        let directory_offset = self.position;
        let mut buf = TableBuf::new();
        buf.put_u32(self.directory.len() as u32);
        for (name, block) in &self.directory {
            buf.put_str(name);
            block.put(&mut buf);
        }
        self.write_raw(&buf.into_bytes())?;
        self.write_raw(&directory_offset.to_le_bytes())?;
        self.write_raw(FOOTER_MAGIC)?;
        self.out.flush().map_err(|e| CustomError::Write {
            source: e,
            path: self.path.clone(),
        })?;
        debug!(path = %self.path.display(), bytes = self.position, "finished container");
        Ok(())
    }
}

/// Read-only, memory-mapped view of a container file.
pub struct Container {
    path: PathBuf,
    mmap: Mmap,
    header: Header,
    tables: HashMap<String, BlockRef>,
}

impl Container {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| CustomError::ReadWithPath {
            source: e,
            path: path.clone(),
        })?;
        // SAFETY: the file is opened read-only and is not modified while mapped.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| CustomError::ReadWithPath {
            source: e,
            path: path.clone(),
        })?;

        if mmap.len() < MAGIC.len() + 4 || &mmap[..MAGIC.len()] != MAGIC {
            return Err(CustomError::Magic { path });
        }
        let header_len =
            u32::from_le_bytes([mmap[8], mmap[9], mmap[10], mmap[11]]) as usize;
        let header_end = 12 + header_len;
        let header_bytes = mmap.get(12..header_end).ok_or_else(|| CustomError::CorruptTable {
            table: "header".to_string(),
            reason: "truncated".to_string(),
        })?;
        let header = Header::decode(header_bytes)?;

        let tables = read_directory(&mmap, header_end)?;
        debug!(
            path = %path.display(),
            format = %header.format,
            version = header.version,
            tables = tables.len(),
            "opened container"
        );
        Ok(Self {
            path,
            mmap,
            header,
            tables,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn table(&self, name: &str) -> Result<Cow<'_, [u8]>> {
        let block = self
            .tables
            .get(name)
            .ok_or_else(|| CustomError::MissingTable {
                table: name.to_string(),
            })?;
        self.block(block, name)
    }

    pub fn optional_table(&self, name: &str) -> Result<Option<Cow<'_, [u8]>>> {
        match self.tables.get(name) {
            Some(block) => self.block(block, name).map(Some),
            None => Ok(None),
        }
    }

    /// Raw contents of a block, inflated if it was stored compressed.
    pub fn block(&self, block: &BlockRef, name: &str) -> Result<Cow<'_, [u8]>> {
        let corrupt = |reason: String| CustomError::CorruptTable {
            table: name.to_string(),
            reason,
        };
        let end = block
            .offset
            .checked_add(block.stored_len)
            .filter(|&end| end <= self.mmap.len() as u64)
            .ok_or_else(|| corrupt(format!("block at {} extends past end of file", block.offset)))?;
        let stored = &self.mmap[block.offset as usize..end as usize];

        if !block.compressed {
            if stored.len() as u64 != block.raw_len {
                return Err(corrupt("stored and raw lengths differ".to_string()));
            }
            return Ok(Cow::Borrowed(stored));
        }

        // raw_len comes from the file, so it only bounds the read
        let mut raw = Vec::new();
        ZlibDecoder::new(stored)
            .take(block.raw_len.saturating_add(1))
            .read_to_end(&mut raw)
            .map_err(|e| corrupt(format!("zlib: {e}")))?;
        if raw.len() as u64 != block.raw_len {
            return Err(corrupt(format!(
                "inflated to {} byte(s), expected {}",
                raw.len(),
                block.raw_len
            )));
        }
        Ok(Cow::Owned(raw))
    }
}

fn read_directory(data: &[u8], header_end: usize) -> Result<HashMap<String, BlockRef>> {
    let corrupt = |reason: &str| CustomError::CorruptTable {
        table: "directory".to_string(),
        reason: reason.to_string(),
    };
    if data.len() < header_end + FOOTER_SIZE || &data[data.len() - 8..] != FOOTER_MAGIC {
        return Err(corrupt("missing footer, file is truncated or was not closed"));
    }
    let footer = data.len() - FOOTER_SIZE;
    let mut offset_bytes = [0u8; 8];
    offset_bytes.copy_from_slice(&data[footer..footer + 8]);
    let directory_offset = u64::from_le_bytes(offset_bytes) as usize;
    if directory_offset < header_end || directory_offset > footer {
        return Err(corrupt("directory offset out of range"));
    }

    let mut cur = TableCursor::new("directory", &data[directory_offset..footer]);
    let n = cur.get_u32()?;
    let mut tables = HashMap::with_capacity(n as usize);
    for _ in 0..n {
        let name = cur.get_str()?;
        let block = BlockRef::get(&mut cur)?;
        tables.insert(name, block);
    }
    cur.finish()?;
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("genopack-unit");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("{}-{}", std::process::id(), name))
    }

    fn header(compressed: bool) -> Header {
        Header {
            format: "genotype-matrix".to_string(),
            version: 2,
            compat_version: 1,
            layout: "sdat".to_string(),
            compressed,
        }
    }

    #[test]
    fn tables_round_trip_with_and_without_compression() {
        for compressed in [false, true] {
            let path = temp_path(&format!("container-{compressed}.gpk"));
            let mut writer = ContainerWriter::create(&path, &header(compressed)).unwrap();
            let payload: Vec<u8> = (0..1000u32).map(|i| (i % 7) as u8).collect();
            let block = writer.write_block(&payload).unwrap();
            writer
                .write_table("names", &encode_strings(&["a", "", "ccc"]))
                .unwrap();
            writer.finish().unwrap();

            let container = Container::open(&path).unwrap();
            assert_eq!(container.header(), &header(compressed));
            assert_eq!(block.compressed, compressed);
            assert_eq!(container.block(&block, "data").unwrap().as_ref(), &payload[..]);
            let names = decode_strings("names", &container.table("names").unwrap()).unwrap();
            assert_eq!(names, ["a", "", "ccc"]);
            assert!(container.optional_table("absent").unwrap().is_none());
            match container.table("absent").unwrap_err() {
                CustomError::MissingTable { table } => assert_eq!(table, "absent"),
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_foreign_and_truncated_files() {
        let path = temp_path("foreign.gpk");
        std::fs::write(&path, b"GENO 2 3 0 0").unwrap();
        assert!(matches!(Container::open(&path), Err(CustomError::Magic { .. })));

        let path = temp_path("truncated.gpk");
        let mut writer = ContainerWriter::create(&path, &header(false)).unwrap();
        writer.write_table("rows", &encode_strings(&["r1"])).unwrap();
        writer.finish().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        match Container::open(&path) {
            Err(CustomError::CorruptTable { table, .. }) => assert_eq!(table, "directory"),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("truncated file opened"),
        }
    }

    /// Position of the first directory entry's `raw_len` field.
    fn first_raw_len_at(bytes: &[u8]) -> usize {
        let footer = bytes.len() - FOOTER_SIZE;
        let directory = u64::from_le_bytes(bytes[footer..footer + 8].try_into().unwrap()) as usize;
        let name_len =
            u32::from_le_bytes(bytes[directory + 4..directory + 8].try_into().unwrap()) as usize;
        // entry count, name, offset, stored_len
        directory + 4 + 4 + name_len + 8 + 8
    }

    #[test]
    fn rejects_block_lengths_the_file_cannot_hold() {
        for compressed in [false, true] {
            let path = temp_path(&format!("raw-len-{compressed}.gpk"));
            let mut writer = ContainerWriter::create(&path, &header(compressed)).unwrap();
            writer.write_table("rows", &encode_strings(&["r1", "r2"])).unwrap();
            writer.finish().unwrap();

            let mut bytes = std::fs::read(&path).unwrap();
            let at = first_raw_len_at(&bytes);
            bytes[at..at + 8].copy_from_slice(&(u64::MAX / 2).to_le_bytes());
            std::fs::write(&path, &bytes).unwrap();

            let container = Container::open(&path).unwrap();
            match container.table("rows") {
                Err(CustomError::CorruptTable { table, .. }) => assert_eq!(table, "rows"),
                Err(other) => panic!("unexpected error: {other:?}"),
                Ok(_) => panic!("oversized block was accepted"),
            }
        }
    }

    #[test]
    fn rejects_block_offsets_past_the_mapping() {
        let path = temp_path("offset.gpk");
        let mut writer = ContainerWriter::create(&path, &header(false)).unwrap();
        writer.write_table("rows", &encode_strings(&["r1"])).unwrap();
        writer.finish().unwrap();
        let container = Container::open(&path).unwrap();
        let block = BlockRef {
            offset: u64::MAX - 4,
            stored_len: 16,
            raw_len: 16,
            compressed: false,
        };
        assert!(matches!(
            container.block(&block, "rows"),
            Err(CustomError::CorruptTable { .. })
        ));
    }

    #[test]
    fn cursor_reports_truncation() {
        let mut buf = TableBuf::new();
        buf.put_u16(7);
        buf.put_i32(-1);
        let bytes = buf.into_bytes();
        let mut cur = TableCursor::new("t", &bytes);
        assert_eq!(cur.get_u16().unwrap(), 7);
        assert_eq!(cur.get_i32().unwrap(), -1);
        cur.finish().unwrap();
        assert!(matches!(cur.get_u8(), Err(CustomError::CorruptTable { .. })));

        let mut cur = TableCursor::new("t", &[5, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(cur.get_len(), Err(CustomError::CorruptTable { .. })));
    }
}
