//! LGP archive containers. The on-disk layout is a 12-byte creator tag,
//! a 27-byte-per-file table of contents, a two-character lookup table
//! bucketing that TOC, and a conflict table disambiguating files that
//! share a name across directories. File content sits in data blocks
//! (20-byte name, u32 length, body) at the positions the TOC records.
//!
//! The TOC does not store sizes: a member's extent is the gap to the next
//! data block, discovered lazily from the position-sorted entry list.

use std::io::{Read, Seek, SeekFrom};

use crate::{u16_le, u32_le, Error, Result};

/// Characters a filename can hash to in the lookup table.
pub const LOOKUP_VALUE_MAX: usize = 30;
pub const LOOKUP_TABLE_ENTRIES: usize = LOOKUP_VALUE_MAX * LOOKUP_VALUE_MAX;
/// Upper bound on conflict-table entries across all groups.
pub const MAX_CONFLICTS: usize = 4096;

const CREATOR_SIZE: usize = 12;
/// 20-byte filename + u32 position + 1 unused byte + u16 conflict flag.
const TOC_ENTRY_SIZE: usize = 27;
/// Each data block starts with a 20-byte name and a u32 length.
const DATA_HEADER_SIZE: u64 = 24;

#[derive(Debug, Clone)]
pub struct LgpEntry {
    pub name: String,
    pub dir: String,
    pub position: u32,
    /// 0 = unique name, otherwise 1-based conflict-group index.
    conflict: u16,
}

#[derive(Debug, Clone, Copy)]
struct LookupBucket {
    toc_offset: u16,
    file_count: u16,
}

#[derive(Debug, Clone)]
struct ConflictEntry {
    dir: String,
    toc_index: u16,
}

pub struct Lgp<R> {
    io: R,
    archive_len: u64,
    entries: Vec<LgpEntry>,
    entry_errors: Vec<(usize, Error)>,
    lookup: Vec<LookupBucket>,
    conflicts: Vec<Vec<ConflictEntry>>,
    /// Content sizes per TOC index, resolved on first use.
    sizes: Option<Vec<Option<u64>>>,
}

/// Hash value of one filename character, `None` when the character
/// terminates the hashable prefix (a dot or NUL).
fn lookup_value(c: u8) -> Option<u8> {
    let c = c.to_ascii_lowercase();
    match c {
        0 | b'.' => None,
        b'a'..=b'z' => Some(c - b'a'),
        b'0'..=b'9' => Some(c - b'0'),
        b'_' => Some(b'k' - b'a'),
        b'-' => Some(b'l' - b'a'),
        _ => Some(0),
    }
}

/// Bucket index for a filename: first character picks the row, second
/// the column (dot or end of name selects column 0).
fn lookup_bucket(name: &str) -> Option<usize> {
    let bytes = name.as_bytes();
    let first = lookup_value(*bytes.first()?)? as usize;
    let second = match bytes.get(1).copied() {
        None => 0,
        Some(c) => match lookup_value(c) {
            None => 0,
            Some(v) => v as usize + 1,
        },
    };
    let bucket = first * LOOKUP_VALUE_MAX + second;
    if bucket < LOOKUP_TABLE_ENTRIES {
        Some(bucket)
    } else {
        None
    }
}

fn nul_trimmed(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_string()
}

impl<R: Read + Seek> Lgp<R> {
    /// Parses the archive header, TOC, lookup table and conflict table.
    /// Individual TOC records pointing outside the archive are recorded
    /// in [`Lgp::entry_errors`] and do not abort the rest.
    pub fn open(mut io: R) -> Result<Lgp<R>> {
        let archive_len = io.seek(SeekFrom::End(0))?;
        io.seek(SeekFrom::Start(0))?;

        let mut head = [0u8; CREATOR_SIZE + 4];
        io.read_exact(&mut head)?;
        let file_count = u32::from_le_bytes([head[12], head[13], head[14], head[15]]) as usize;

        let toc_len = file_count.checked_mul(TOC_ENTRY_SIZE).ok_or_else(|| {
            Error::UnsupportedFormat("archive file count is unreasonably large".to_string())
        })?;
        if (CREATOR_SIZE + 4 + toc_len) as u64 > archive_len {
            return Err(Error::TruncatedSection(
                "archive TOC extends beyond end of file".to_string(),
            ));
        }

        let mut toc_raw = vec![0u8; toc_len];
        io.read_exact(&mut toc_raw)?;

        let mut entries = Vec::with_capacity(file_count);
        let mut entry_errors = Vec::new();
        for i in 0..file_count {
            let rec = &toc_raw[i * TOC_ENTRY_SIZE..(i + 1) * TOC_ENTRY_SIZE];
            let name = nul_trimmed(&rec[0..20]);
            let position = u32_le(rec, 20)?;
            let conflict = u16_le(rec, 25)?;

            if (position as u64) + DATA_HEADER_SIZE > archive_len {
                entry_errors.push((
                    i,
                    Error::TruncatedSection(format!(
                        "entry {:?} points at {} beyond end of archive",
                        name, position
                    )),
                ));
            }

            entries.push(LgpEntry {
                name,
                dir: String::new(),
                position,
                conflict,
            });
        }

        let mut lookup_raw = vec![0u8; LOOKUP_TABLE_ENTRIES * 4];
        io.read_exact(&mut lookup_raw)?;
        let mut lookup = Vec::with_capacity(LOOKUP_TABLE_ENTRIES);
        for i in 0..LOOKUP_TABLE_ENTRIES {
            lookup.push(LookupBucket {
                toc_offset: u16_le(&lookup_raw, i * 4)?,
                file_count: u16_le(&lookup_raw, i * 4 + 2)?,
            });
        }

        let conflicts = Self::read_conflicts(&mut io, &mut entries)?;

        Ok(Lgp {
            io,
            archive_len,
            entries,
            entry_errors,
            lookup,
            conflicts,
            sizes: None,
        })
    }

    fn read_conflicts(io: &mut R, entries: &mut [LgpEntry]) -> Result<Vec<Vec<ConflictEntry>>> {
        let mut word = [0u8; 2];
        io.read_exact(&mut word)?;
        let group_count = u16::from_le_bytes(word) as usize;

        let mut total = 0usize;
        let mut groups = Vec::with_capacity(group_count);
        for _ in 0..group_count {
            io.read_exact(&mut word)?;
            let entry_count = u16::from_le_bytes(word) as usize;

            total += entry_count;
            if total > MAX_CONFLICTS {
                return Err(Error::ConflictTableOverflow);
            }

            let mut group = Vec::with_capacity(entry_count);
            let mut rec = [0u8; 130];
            for _ in 0..entry_count {
                io.read_exact(&mut rec)?;
                let dir = nul_trimmed(&rec[0..128]);
                let toc_index = u16::from_le_bytes([rec[128], rec[129]]);

                // Conflicted entries learn their directory from here;
                // the TOC itself only stores the bare filename.
                if let Some(entry) = entries.get_mut(toc_index as usize) {
                    entry.dir = dir.clone();
                }
                group.push(ConflictEntry { dir, toc_index });
            }
            groups.push(group);
        }

        Ok(groups)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All parsed entries, in TOC order.
    pub fn entries(&self) -> &[LgpEntry] {
        &self.entries
    }

    /// Per-entry parse failures: `(toc_index, error)` pairs. Listing and
    /// opening other entries is unaffected by these.
    pub fn entry_errors(&self) -> &[(usize, Error)] {
        &self.entry_errors
    }

    fn is_damaged(&self, index: usize) -> bool {
        self.entry_errors.iter().any(|(i, _)| *i == index)
    }

    /// Content size of entry `index`, excluding the 24-byte data-block
    /// header. Computed from the gap to the next data block and cached.
    pub fn entry_size(&mut self, index: usize) -> Result<u64> {
        if index >= self.entries.len() {
            return Err(Error::TruncatedSection(format!(
                "entry index {} out of range ({} entries)",
                index,
                self.entries.len()
            )));
        }

        if self.sizes.is_none() {
            self.sizes = Some(self.compute_sizes());
        }

        match self.sizes.as_ref().and_then(|s| s[index]) {
            Some(size) => Ok(size),
            None => Err(Error::TruncatedSection(format!(
                "entry {:?} has no measurable extent",
                self.entries[index].name
            ))),
        }
    }

    fn compute_sizes(&self) -> Vec<Option<u64>> {
        // Offset-sorted view of the TOC; the gap to the successor bounds
        // each member, the last one runs to end of archive.
        let mut order: Vec<usize> = (0..self.entries.len())
            .filter(|&i| !self.is_damaged(i))
            .collect();
        order.sort_by_key(|&i| self.entries[i].position);

        let mut sizes = vec![None; self.entries.len()];
        for (rank, &i) in order.iter().enumerate() {
            let start = self.entries[i].position as u64;
            let end = order
                .get(rank + 1)
                .map(|&j| self.entries[j].position as u64)
                .unwrap_or(self.archive_len);
            if end >= start + DATA_HEADER_SIZE {
                sizes[i] = Some(end - start - DATA_HEADER_SIZE);
            }
        }
        sizes
    }

    /// Looks up an entry by logical name, consulting the conflict table
    /// when the name is flagged ambiguous. `dir` only matters for
    /// conflicted names; pass `""` otherwise.
    pub fn find(&self, name: &str, dir: &str) -> Option<usize> {
        let bucket = self.lookup.get(lookup_bucket(name)?)?;
        if bucket.toc_offset == 0 {
            return None;
        }

        let start = bucket.toc_offset as usize - 1;
        let end = (start + bucket.file_count as usize).min(self.entries.len());
        for i in start..end {
            if !self.entries[i].name.eq_ignore_ascii_case(name) {
                continue;
            }
            if self.entries[i].conflict == 0 {
                return Some(i);
            }
            // Ambiguous name: the conflict group decides which TOC
            // record belongs to the requested directory.
            let group = self.conflicts.get(self.entries[i].conflict as usize - 1)?;
            return group
                .iter()
                .find(|c| c.dir.eq_ignore_ascii_case(dir))
                .map(|c| c.toc_index as usize);
        }
        None
    }

    /// Opens entry `index` as a read-only seekable window over the
    /// member's content bytes. The archive is never read ahead of the
    /// caller; only the windowed range is reachable.
    pub fn open_entry(&mut self, index: usize) -> Result<EntryReader<'_, R>> {
        if let Some((_, err)) = self.entry_errors.iter().find(|(i, _)| *i == index) {
            return Err(Error::TruncatedSection(format!(
                "entry {} is damaged: {}",
                index, err
            )));
        }
        let size = self.entry_size(index)?;
        let start = self.entries[index].position as u64 + DATA_HEADER_SIZE;
        Ok(EntryReader {
            io: &mut self.io,
            start,
            len: size,
            pos: 0,
        })
    }

    /// Convenience wrapper: reads a whole member into memory.
    pub fn read_entry(&mut self, index: usize) -> Result<Vec<u8>> {
        let mut reader = self.open_entry(index)?;
        let mut buf = Vec::with_capacity(reader.len as usize);
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Read-only view over `[start, start + len)` of the archive stream.
/// Writing is unsupported; archives are rebuilt wholesale instead.
pub struct EntryReader<'a, R> {
    io: &'a mut R,
    start: u64,
    len: u64,
    pos: u64,
}

impl<R> EntryReader<'_, R> {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<R: Read + Seek> Read for EntryReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let remaining = (self.len - self.pos) as usize;
        let want = buf.len().min(remaining);

        self.io.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.io.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for EntryReader<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(delta) => self.len as i64 + delta,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of entry",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
