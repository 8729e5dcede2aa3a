//! Per-query spill file for metric blocks returned by the shards.
//!
//! A query's working set can far exceed RAM, and the merge stage reads
//! blocks back concurrently, so blocks are appended to a temporary file
//! during scatter and re-read by `(offset, len)` address afterwards.
//!
//! Small result sets never touch the disk: writes accumulate in memory
//! until they exceed [`MAX_IN_MEMORY_SPILL_SIZE`].
//!
//! The finalize step is encoded in the types: [`SpillFile::finalize`]
//! consumes the writer and returns a [`FinalizedSpill`], so an address
//! can only ever be resolved against a finalized file. Dropping either
//! value releases the backing storage (the temp file is unlinked at
//! creation).

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

/// Spills larger than this move from memory to a temp file.
const MAX_IN_MEMORY_SPILL_SIZE: usize = 64 * 1024;

/// The opaque address of one block inside a spill file.
///
/// Valid only for the [`FinalizedSpill`] built from the [`SpillFile`]
/// that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockAddr {
    offset: u64,
    len: usize,
}

#[derive(Debug)]
enum Backing {
    Memory { buf: Vec<u8>, dir: Option<PathBuf> },
    File(BufWriter<File>),
}

/// The write side of a spill file, owned by one query's scatter stage.
#[derive(Debug)]
pub struct SpillFile {
    backing: Backing,
    size: u64,
}

impl SpillFile {
    /// Creates an empty spill. The backing temp file, if one becomes
    /// necessary, is created under `dir` (or the system temp directory).
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            backing: Backing::Memory {
                buf: Vec::new(),
                dir,
            },
            size: 0,
        }
    }

    /// Appends one block payload, returning its address.
    pub fn write_block(&mut self, payload: &[u8]) -> io::Result<BlockAddr> {
        let addr = BlockAddr {
            offset: self.size,
            len: payload.len(),
        };

        if let Backing::Memory { buf, dir } = &mut self.backing {
            if buf.len() + payload.len() <= MAX_IN_MEMORY_SPILL_SIZE {
                buf.extend_from_slice(payload);
                self.size += payload.len() as u64;
                return Ok(addr);
            }

            // The spill outgrew memory: move what we have to a file and
            // keep appending there.
            let file = match dir {
                Some(dir) => tempfile::tempfile_in(&*dir)?,
                None => tempfile::tempfile()?,
            };
            let mut writer = BufWriter::new(file);
            writer.write_all(buf)?;
            self.backing = Backing::File(writer);
        }

        match &mut self.backing {
            Backing::File(writer) => writer.write_all(payload)?,
            Backing::Memory { .. } => unreachable!("memory backing handled above"),
        }
        self.size += payload.len() as u64;
        Ok(addr)
    }

    /// Flushes and re-opens the spill for random-access reads.
    pub fn finalize(self) -> io::Result<FinalizedSpill> {
        let backing = match self.backing {
            Backing::Memory { buf, .. } => FinalizedBacking::Memory(buf),
            Backing::File(writer) => {
                let file = writer.into_inner().map_err(|e| e.into_error())?;
                file.sync_data()?;
                FinalizedBacking::File(file)
            }
        };
        Ok(FinalizedSpill { backing })
    }
}

#[derive(Debug)]
enum FinalizedBacking {
    Memory(Vec<u8>),
    File(File),
}

/// The read side of a spill file. Reads are positioned, so the merge
/// stage can resolve many addresses concurrently through one handle.
#[derive(Debug)]
pub struct FinalizedSpill {
    backing: FinalizedBacking,
}

impl FinalizedSpill {
    /// Reads the block at `addr` into `dst`, replacing its contents.
    pub fn read_block_at(&self, addr: BlockAddr, dst: &mut Vec<u8>) -> io::Result<()> {
        dst.clear();
        dst.resize(addr.len, 0);
        match &self.backing {
            FinalizedBacking::Memory(buf) => {
                let start = addr.offset as usize;
                let end = start
                    .checked_add(addr.len)
                    .filter(|&end| end <= buf.len())
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("block address {addr:?} is out of bounds"),
                        )
                    })?;
                dst.copy_from_slice(&buf[start..end]);
                Ok(())
            }
            FinalizedBacking::File(file) => {
                use std::os::unix::fs::FileExt;
                file.read_exact_at(dst, addr.offset)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn write_read_round_trip_in_memory() {
        let mut spill = SpillFile::new(None);
        let a = spill.write_block(b"first block").unwrap();
        let b = spill.write_block(b"").unwrap();
        let c = spill.write_block(b"third").unwrap();

        let spill = spill.finalize().unwrap();
        let mut buf = Vec::new();

        spill.read_block_at(a, &mut buf).unwrap();
        assert_eq!(buf, b"first block");
        spill.read_block_at(b, &mut buf).unwrap();
        assert!(buf.is_empty());
        spill.read_block_at(c, &mut buf).unwrap();
        assert_eq!(buf, b"third");
    }

    #[test]
    fn large_spill_moves_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut spill = SpillFile::new(Some(dir.path().to_owned()));

        let payloads: Vec<Vec<u8>> = (0u8..40).map(|i| vec![i; 4096]).collect();
        let addrs: Vec<BlockAddr> = payloads
            .iter()
            .map(|p| spill.write_block(p).unwrap())
            .collect();

        // 40 * 4 KiB is comfortably past the in-memory threshold.
        let spill = spill.finalize().unwrap();
        let mut buf = Vec::new();
        for (addr, payload) in addrs.iter().zip(&payloads) {
            spill.read_block_at(*addr, &mut buf).unwrap();
            assert_eq!(&buf, payload);
        }
    }

    #[test]
    fn addresses_are_unique_per_spill() {
        let mut spill = SpillFile::new(None);
        let addrs: HashSet<BlockAddr> = (0..100)
            .map(|_| spill.write_block(b"payload").unwrap())
            .collect();
        assert_eq!(addrs.len(), 100);
    }

    #[test]
    fn out_of_bounds_address_is_an_error() {
        let mut spill = SpillFile::new(None);
        let _ = spill.write_block(b"data").unwrap();
        let spill = spill.finalize().unwrap();

        let bogus = BlockAddr {
            offset: 1000,
            len: 10,
        };
        let mut buf = Vec::new();
        assert!(spill.read_block_at(bogus, &mut buf).is_err());
    }
}
