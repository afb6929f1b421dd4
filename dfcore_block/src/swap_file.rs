//! The pool's append-only swap file with a free-extent list for space
//! reuse (§4.1 residency policy, §6.5 persisted state layout).

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

pub(crate) struct SwapFile {
    file: File,
    end_offset: u64,
    /// Sorted, non-overlapping free extents available for reuse before
    /// growing the file further.
    free: Vec<(u64, u64)>,
}

impl SwapFile {
    pub(crate) fn create(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(SwapFile {
            file,
            end_offset: 0,
            free: Vec::new(),
        })
    }

    /// Writes `data`, reusing a free extent if one fits, else appending.
    /// Returns the offset written to.
    pub(crate) fn write_block(&mut self, data: &[u8]) -> io::Result<u64> {
        let len = data.len() as u64;
        let offset = if let Some(idx) = self.free.iter().position(|&(_, l)| l >= len) {
            let (extent_offset, extent_len) = self.free[idx];
            if extent_len == len {
                self.free.remove(idx);
            } else {
                self.free[idx] = (extent_offset + len, extent_len - len);
            }
            extent_offset
        } else {
            let offset = self.end_offset;
            self.end_offset += len;
            offset
        };

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(offset)
    }

    pub(crate) fn read_block(&mut self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Releases `[offset, offset+len)` back to the free list, merging
    /// with adjacent extents.
    pub(crate) fn free_extent(&mut self, offset: u64, len: u64) {
        let insert_at = self.free.partition_point(|&(o, _)| o < offset);
        self.free.insert(insert_at, (offset, len));

        if insert_at + 1 < self.free.len() {
            let (o, l) = self.free[insert_at];
            let (next_o, next_l) = self.free[insert_at + 1];
            if o + l == next_o {
                self.free[insert_at] = (o, l + next_l);
                self.free.remove(insert_at + 1);
            }
        }
        if insert_at > 0 {
            let (prev_o, prev_l) = self.free[insert_at - 1];
            let (o, l) = self.free[insert_at];
            if prev_o + prev_l == o {
                self.free[insert_at - 1] = (prev_o, prev_l + l);
                self.free.remove(insert_at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let dir = std::env::temp_dir().join(format!("dfcore-swap-test-{}", std::process::id()));
        let mut sf = SwapFile::create(dir).unwrap();
        let off = sf.write_block(b"hello world").unwrap();
        let back = sf.read_block(off, 11).unwrap();
        assert_eq!(&back, b"hello world");
    }

    #[test]
    fn freed_extent_is_reused() {
        let dir = std::env::temp_dir().join(format!("dfcore-swap-test2-{}", std::process::id()));
        let mut sf = SwapFile::create(dir).unwrap();
        let a = sf.write_block(&vec![1u8; 64]).unwrap();
        sf.free_extent(a, 64);
        let end_before = sf.end_offset;
        let b = sf.write_block(&vec![2u8; 64]).unwrap();
        assert_eq!(b, a);
        assert_eq!(sf.end_offset, end_before);
    }
}
