//! The write-ahead log writer.
//!
//! A log is a sequence of 32KiB blocks, each holding one or more fragments.
//! A fragment is a seven-byte header (masked crc32c, length, type) followed
//! by payload.  Records small enough for the current block go out as a
//! single FULL fragment; anything else becomes FIRST, zero or more MIDDLEs,
//! and a LAST.  A block tail too small for a header is zero-padded, so a
//! reader can treat every block independently.

use std::cmp;
use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::Path;

use biometrics::Counter;

use super::coding::encode_fixed32;
use super::Error;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static ADD_RECORD: Counter = Counter::new("memlog.log.add_record");
static EMIT: Counter = Counter::new("memlog.log.emit");
static PAD_BLOCK: Counter = Counter::new("memlog.log.pad_block");
static FSYNC: Counter = Counter::new("memlog.log.fsync");

/// Register the biometrics for the log.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&ADD_RECORD);
    collector.register_counter(&EMIT);
    collector.register_counter(&PAD_BLOCK);
    collector.register_counter(&FSYNC);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The size of a log block.  Fragments never cross a block boundary.
pub const BLOCK_SIZE: usize = 32768;
/// The size of a fragment header: fixed32 masked crc, two bytes of length,
/// one byte of type.
pub const HEADER_SIZE: usize = 7;

const MASK_DELTA: u32 = 0xa282ead8;

//////////////////////////////////////////// RecordType ////////////////////////////////////////////

/// The position of a fragment within its record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordType {
    /// Padding at the tail of a block.  Never written as a fragment type;
    /// readers treat it as end-of-block.
    Zero = 0,
    /// The record fits in one fragment.
    Full = 1,
    /// The first fragment of a record that spans blocks.
    First = 2,
    /// An interior fragment.
    Middle = 3,
    /// The final fragment of a record that spans blocks.
    Last = 4,
}

const NUM_RECORD_TYPES: usize = RecordType::Last as usize + 1;

////////////////////////////////////////////// masking /////////////////////////////////////////////

/// Mask a crc so that a crc computed over bytes that themselves contain an
/// embedded crc does not collide with the unembedded form.
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Recover the crc hidden by [mask_crc].
pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

/////////////////////////////////////////////// Write //////////////////////////////////////////////

/// An extension of std::io::Write that does fsync.
pub trait Write: std::io::Write {
    /// Return when the data is known to be durable.
    fn fsync(&mut self) -> Result<(), Error>;
}

impl Write for File {
    fn fsync(&mut self) -> Result<(), Error> {
        Ok(self.sync_data()?)
    }
}

impl Write for &mut Vec<u8> {
    fn fsync(&mut self) -> Result<(), Error> {
        // pass
        Ok(())
    }
}

impl<W: Write> Write for BufWriter<W> {
    fn fsync(&mut self) -> Result<(), Error> {
        self.get_mut().fsync()
    }
}

//////////////////////////////////////////// LogOptions ////////////////////////////////////////////

/// Options used for creating logs.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "command_line", derive(arrrg_derive::CommandLine))]
pub struct LogOptions {
    /// The number of bytes to use for a write buffer.
    #[cfg_attr(feature = "command_line", arrrg(optional, "Size of the write buffer."))]
    pub(crate) write_buffer: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            write_buffer: BLOCK_SIZE * 2,
        }
    }
}

///////////////////////////////////////////// LogWriter ////////////////////////////////////////////

/// A non-concurrent log writer.  The engine serializes callers.
pub struct LogWriter<W: Write> {
    output: W,
    block_offset: usize,
    type_crc: [u32; NUM_RECORD_TYPES],
}

impl LogWriter<BufWriter<File>> {
    /// Create a new log at `file_name` with the provided options.
    pub fn create<P: AsRef<Path>>(options: LogOptions, file_name: P) -> Result<Self, Error> {
        let file: File = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(file_name)?;
        Ok(Self::new(BufWriter::with_capacity(
            options.write_buffer,
            file,
        )))
    }
}

impl<W: Write> LogWriter<W> {
    /// Create a log writer positioned at the start of a fresh log.
    pub fn new(output: W) -> Self {
        Self::with_offset(output, 0)
    }

    /// Create a log writer that appends to a log of `dest_length` bytes.
    /// The writer picks up where the existing bytes leave off on the block
    /// grid.
    pub fn with_offset(output: W, dest_length: u64) -> Self {
        let mut type_crc = [0u32; NUM_RECORD_TYPES];
        for (idx, crc) in type_crc.iter_mut().enumerate() {
            *crc = crc32c::crc32c(&[idx as u8]);
        }
        Self {
            output,
            block_offset: (dest_length % BLOCK_SIZE as u64) as usize,
            type_crc,
        }
    }

    /// Append one record to the log, fragmenting as needed.  An empty
    /// payload still emits a zero-length FULL fragment.
    pub fn add_record(&mut self, payload: &[u8]) -> Result<(), Error> {
        ADD_RECORD.click();
        let mut ptr = payload;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Fill the trailer so the next header starts a fresh block.
                if leftover > 0 {
                    PAD_BLOCK.click();
                    self.output.write_all(&[0u8; HEADER_SIZE - 1][..leftover])?;
                }
                self.block_offset = 0;
            }
            // Invariant: a block always has room for at least a header here.
            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = cmp::min(ptr.len(), avail);
            let end = fragment_length == ptr.len();
            let record_type = if begin && end {
                RecordType::Full
            } else if begin {
                RecordType::First
            } else if end {
                RecordType::Last
            } else {
                RecordType::Middle
            };
            self.emit_physical_record(record_type, &ptr[..fragment_length])?;
            ptr = &ptr[fragment_length..];
            begin = false;
            if ptr.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Flush the log to the OS.  This does not call fsync.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.output.flush()?;
        Ok(())
    }

    /// fsync the log.
    pub fn fsync(&mut self) -> Result<(), Error> {
        FSYNC.click();
        self.output.flush()?;
        self.output.fsync()
    }

    fn emit_physical_record(
        &mut self,
        record_type: RecordType,
        fragment: &[u8],
    ) -> Result<(), Error> {
        EMIT.click();
        assert!(fragment.len() <= 0xffff);
        assert!(self.block_offset + HEADER_SIZE + fragment.len() <= BLOCK_SIZE);
        let crc = crc32c::crc32c_append(self.type_crc[record_type as usize], fragment);
        let mut header = [0u8; HEADER_SIZE];
        encode_fixed32(&mut header, mask_crc(crc));
        header[4] = (fragment.len() & 0xff) as u8;
        header[5] = (fragment.len() >> 8) as u8;
        header[6] = record_type as u8;
        self.output.write_all(&header)?;
        self.output.write_all(fragment)?;
        self.output.flush()?;
        self.block_offset += HEADER_SIZE + fragment.len();
        Ok(())
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod masking {
    use super::*;

    #[test]
    fn round_trip() {
        for crc in [0u32, 1, 0x12345678, 0xa282ead8, u32::MAX] {
            assert_eq!(crc, unmask_crc(mask_crc(crc)));
        }
    }

    #[test]
    fn masked_differs() {
        let crc = crc32c::crc32c(b"foo");
        assert_ne!(crc, mask_crc(crc));
        assert_ne!(crc, mask_crc(mask_crc(crc)));
    }
}
