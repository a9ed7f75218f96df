//! `PageSource` reading a data page's LSN straight out of its header.
//!
//! Full page-header validation (checksums, page version, hole compaction)
//! is out of scope; `pd_lsn` is the first 8 bytes of every page and is all
//! the DELTA skip law needs.

use std::path::Path;

use catchup::transfer::PageSource;

pub struct PageLsnReader;

impl PageSource for PageLsnReader {
    fn block_lsn(&self, _relpath: &Path, _block_no: u64, data: &[u8]) -> Option<u64> {
        let bytes: [u8; 8] = data.get(0..8)?.try_into().ok()?;
        let lsn = u64::from_le_bytes(bytes);
        (lsn != 0).then_some(lsn)
    }
}
