//! Boot-time RAM size discovery
//!
//! QEMU `virt` hands the kernel a flattened device tree in x0; older boot
//! loaders pass a legacy ATAG list instead. The input is untrusted memory:
//! every read is bounded and a corrupt list ends parsing, never loops.

/// Read access to boot-time physical memory
pub trait PhysReader {
    fn read_u8(&self, addr: u64) -> u8;

    /// Little-endian 32-bit word
    fn read_u32(&self, addr: u64) -> u32 {
        u32::from_le_bytes([
            self.read_u8(addr),
            self.read_u8(addr + 1),
            self.read_u8(addr + 2),
            self.read_u8(addr + 3),
        ])
    }

    /// Big-endian 32-bit word (device tree cells)
    fn read_be32(&self, addr: u64) -> u32 {
        u32::from_be_bytes([
            self.read_u8(addr),
            self.read_u8(addr + 1),
            self.read_u8(addr + 2),
            self.read_u8(addr + 3),
        ])
    }
}

pub const ATAG_NONE: u32 = 0x0000_0000;
pub const ATAG_CORE: u32 = 0x5441_0001;
pub const ATAG_MEM: u32 = 0x5441_0002;

/// Hard cap on tags visited
pub const MAX_ATAGS: usize = 32;

/// ATAG lists live in low memory; anything above is rejected
pub const ATAG_ADDR_LIMIT: u64 = 0x4000_0000;

const ATAG_MIN_WORDS: u32 = 2;
const ATAG_MAX_WORDS: u32 = 32;

/// Where the RAM size came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamSource {
    DeviceTree,
    Atag,
}

/// Scan an ATAG list starting at `ptr` for the memory tag.
///
/// Each tag is `(size_in_words, tag)` followed by its payload; ATAG_MEM's
/// payload is `(size, start)`. Parsing stops at ATAG_NONE, after
/// `MAX_ATAGS` tags, on a size outside `[2, 32]` words, or when the next tag
/// address is out of range or does not advance.
pub fn atag_memory_size<R: PhysReader + ?Sized>(reader: &R, ptr: u64) -> Option<u64> {
    if ptr == 0 || ptr > ATAG_ADDR_LIMIT {
        return None;
    }

    let mut tag_addr = ptr;
    for _ in 0..MAX_ATAGS {
        let words = reader.read_u32(tag_addr);
        let tag = reader.read_u32(tag_addr + 4);

        match tag {
            ATAG_NONE => return None,
            ATAG_MEM => return Some(reader.read_u32(tag_addr + 8) as u64),
            _ => {}
        }

        if !(ATAG_MIN_WORDS..=ATAG_MAX_WORDS).contains(&words) {
            return None;
        }

        let next = tag_addr + words as u64 * 4;
        if next > ATAG_ADDR_LIMIT || next <= tag_addr {
            return None;
        }
        tag_addr = next;
    }

    None
}

/* Flattened device tree */

pub const FDT_MAGIC: u32 = 0xD00D_FEED;

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_NOP: u32 = 4;
const FDT_END: u32 = 9;

/// Upper bound on structure tokens visited
const FDT_MAX_TOKENS: usize = 16 * 1024;
/// Blobs larger than this are treated as corrupt
const FDT_MAX_SIZE: u32 = 2 * 1024 * 1024;

fn align4(value: u64) -> u64 {
    (value + 3) & !3
}

/// Compare the NUL-terminated string at `addr` with `expected`
fn str_eq<R: PhysReader + ?Sized>(reader: &R, addr: u64, limit: u64, expected: &[u8]) -> bool {
    for (i, &b) in expected.iter().enumerate() {
        let at = addr + i as u64;
        if at >= limit || reader.read_u8(at) != b {
            return false;
        }
    }
    addr + (expected.len() as u64) < limit && reader.read_u8(addr + expected.len() as u64) == 0
}

/// True if the node name at `addr` is `memory` or `memory@...`
fn is_memory_node<R: PhysReader + ?Sized>(reader: &R, addr: u64, limit: u64) -> bool {
    for (i, &b) in b"memory".iter().enumerate() {
        let at = addr + i as u64;
        if at >= limit || reader.read_u8(at) != b {
            return false;
        }
    }
    let after = addr + 6;
    after < limit && matches!(reader.read_u8(after), 0 | b'@')
}

/// Length of the NUL-terminated string at `addr`, bounded by `limit`
fn str_len<R: PhysReader + ?Sized>(reader: &R, addr: u64, limit: u64) -> Option<u64> {
    let mut at = addr;
    while at < limit {
        if reader.read_u8(at) == 0 {
            return Some(at - addr);
        }
        at += 1;
    }
    None
}

/// Read a 1- or 2-cell big-endian number
fn read_cells<R: PhysReader + ?Sized>(reader: &R, addr: u64, cells: u32) -> u64 {
    match cells {
        1 => reader.read_be32(addr) as u64,
        _ => ((reader.read_be32(addr) as u64) << 32) | reader.read_be32(addr + 4) as u64,
    }
}

/// Size of the first `/memory` node's first `reg` entry.
///
/// Honors the root node's `#address-cells` / `#size-cells` (defaults 2 and
/// 1). Returns `None` for a bad header, a truncated or runaway structure
/// block, or when no memory node is present.
pub fn fdt_memory_size<R: PhysReader + ?Sized>(reader: &R, blob: u64) -> Option<u64> {
    if blob == 0 || reader.read_be32(blob) != FDT_MAGIC {
        return None;
    }
    let total = reader.read_be32(blob + 4);
    if total < 40 || total > FDT_MAX_SIZE {
        return None;
    }
    let limit = blob + total as u64;
    let structs = blob + reader.read_be32(blob + 8) as u64;
    let strings = blob + reader.read_be32(blob + 12) as u64;
    if structs >= limit || strings >= limit {
        return None;
    }

    let mut address_cells = 2u32;
    let mut size_cells = 1u32;
    let mut depth = 0u32;
    let mut in_memory = false;
    let mut at = structs;

    for _ in 0..FDT_MAX_TOKENS {
        if at + 4 > limit {
            return None;
        }
        let token = reader.read_be32(at);
        at += 4;

        match token {
            FDT_BEGIN_NODE => {
                let name_len = str_len(reader, at, limit)?;
                depth += 1;
                in_memory = depth == 2 && is_memory_node(reader, at, limit);
                at = align4(at + name_len + 1);
            }
            FDT_END_NODE => {
                depth = depth.checked_sub(1)?;
                in_memory = false;
            }
            FDT_PROP => {
                if at + 8 > limit {
                    return None;
                }
                let len = reader.read_be32(at) as u64;
                let name = strings + reader.read_be32(at + 4) as u64;
                let value = at + 8;
                if value + len > limit {
                    return None;
                }

                if depth == 1 && str_eq(reader, name, limit, b"#address-cells") && len == 4 {
                    address_cells = reader.read_be32(value);
                } else if depth == 1 && str_eq(reader, name, limit, b"#size-cells") && len == 4 {
                    size_cells = reader.read_be32(value);
                } else if in_memory && str_eq(reader, name, limit, b"reg") {
                    if !(1..=2).contains(&address_cells) || !(1..=2).contains(&size_cells) {
                        return None;
                    }
                    let entry = (address_cells + size_cells) as u64 * 4;
                    if len < entry {
                        return None;
                    }
                    let size = read_cells(reader, value + address_cells as u64 * 4, size_cells);
                    return Some(size);
                }
                at = align4(value + len);
            }
            FDT_NOP => {}
            FDT_END => return None,
            _ => return None,
        }
    }

    None
}

/// RAM size from whatever the boot loader left at `ptr`: a device tree if the
/// magic matches, otherwise an ATAG list.
pub fn discover_ram_size<R: PhysReader + ?Sized>(reader: &R, ptr: u64) -> Option<(u64, RamSource)> {
    if ptr == 0 {
        return None;
    }
    if reader.read_be32(ptr) == FDT_MAGIC {
        return fdt_memory_size(reader, ptr).map(|size| (size, RamSource::DeviceTree));
    }
    atag_memory_size(reader, ptr).map(|size| (size, RamSource::Atag))
}
