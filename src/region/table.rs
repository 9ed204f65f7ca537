//! On-disk region catalog records and image-file naming.
//!
//! The catalog is a packed sequence of `RegionRecord`s. A pending update is
//! written to `new_table.dat` and renamed over `table.dat` when the undo log
//! commits, so the catalog swaps atomically with the commit record. The same
//! record format travels over the recovery pipe, terminated by an all-zero
//! sentinel.

use bytemuck::{Pod, Zeroable};

pub const TABLE_FILE: &str = "table.dat";
pub const NEW_TABLE_FILE: &str = "new_table.dat";

/// One shadowed region: `mem_<hex-base>_<hex-file-id>` holds its bytes.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct RegionRecord {
    pub base: u64,
    pub size: u64,
    pub file_id: u32,
}

impl RegionRecord {
    pub const SIZE: usize = std::mem::size_of::<RegionRecord>();

    /// The pipe-stream terminator.
    pub fn sentinel() -> RegionRecord {
        RegionRecord::zeroed()
    }

    pub fn is_sentinel(&self) -> bool {
        let (base, size) = (self.base, self.size);
        base == 0 && size == 0
    }
}

/// Lowercase hex, no leading zeros: `mem_7f0000000000_1a2b3c4d`.
pub fn image_file_name(base: usize, file_id: u32) -> String {
    format!("mem_{:x}_{:x}", base, file_id)
}

/// Parses an image file name back into `(base, file_id)`. Returns `None`
/// for files that don't match the pattern.
pub fn parse_image_file_name(name: &str) -> Option<(usize, u32)> {
    let rest = name.strip_prefix("mem_")?;
    let (base, file_id) = rest.split_once('_')?;
    Some((
        usize::from_str_radix(base, 16).ok()?,
        u32::from_str_radix(file_id, 16).ok()?,
    ))
}

/// Decodes a catalog file's contents.
pub fn decode_table(bytes: &[u8]) -> Option<Vec<RegionRecord>> {
    if bytes.len() % RegionRecord::SIZE != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(RegionRecord::SIZE)
            .map(|chunk| *bytemuck::from_bytes::<RegionRecord>(chunk))
            .collect(),
    )
}

/// Encodes records into the packed on-disk form.
pub fn encode_table(records: &[RegionRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * RegionRecord::SIZE);
    for r in records {
        out.extend_from_slice(bytemuck::bytes_of(r));
    }
    out
}
