#![doc = include_str!("../README.md")]

extern crate alloc;

use alloc::fmt;
use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom},
    path::Path,
};

use log::{debug, trace};

/// Size of a logical block, in bytes
pub const LBA_SIZE: u64 = 512;

const MBR_SIGNATURE_OFFSET: usize = 510;
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xaa];
const MBR_PART_ENTRY_OFFSET_BYTES: usize = 446;
const MBR_PART_ENTRY_SIZE_BYTES: usize = 16;
const MBR_PART_ENTRY_NUM: usize = 4;
const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xee;
const MBR_TYPES_EXTENDED: [u8; 3] = [0x05, 0x0f, 0x85];

const GPT_SIGNATURE_HEADER: &[u8; 8] = b"EFI PART";
const GPT_HEADER_LBA: u64 = 1;
const GPT_MIN_ENTRY_SIZE: u64 = 128;
const GPT_MAX_ENTRY_SIZE: u64 = 4096;
const GPT_MAX_ENTRIES: u64 = 256;

const EXT_MAGIC_OFFSET: u64 = 1080;
const EXT_MAGIC: [u8; 2] = [0x53, 0xef];
const XFS_MAGIC: &[u8; 4] = b"XFSB";
const SQUASHFS_MAGIC: &[u8; 4] = b"hsqs";
const BTRFS_MAGIC_OFFSET: u64 = 0x1_0040;
const BTRFS_MAGIC: &[u8; 8] = b"_BHRfS_M";
const ISO9660_MAGIC_OFFSET: u64 = 0x8001;
const ISO9660_MAGIC: &[u8; 5] = b"CD001";
const FAT16_LABEL_OFFSET: usize = 54;
const FAT32_LABEL_OFFSET: usize = 82;

/// The kind of partition table found at the start of an image
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TableKind {
    /// Legacy DOS Master Boot Record
    Mbr,

    /// GUID Partition Table
    Gpt,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mbr => "mbr",
            Self::Gpt => "gpt",
        })
    }
}

/// The type identifier stored in a partition entry
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartitionType {
    /// MBR partition type byte
    Mbr(u8),

    /// GPT partition type GUID, in its on-disk byte order
    Gpt([u8; 16]),
}

/// A partition found in a partition table
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Partition {
    /// Partition number, starting at 1, as the kernel would name it
    pub number: usize,

    /// First LBA of the partition
    pub start_lba: u64,

    /// Size of the partition in LBAs
    pub size_lba: u64,

    /// Partition type
    pub kind: PartitionType,
}

impl Partition {
    /// Offset of the partition from the start of the image, in bytes
    #[must_use]
    pub fn offset_bytes(&self) -> u64 {
        self.start_lba.saturating_mul(LBA_SIZE)
    }

    /// Size of the partition, in bytes
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size_lba.saturating_mul(LBA_SIZE)
    }
}

/// A filesystem recognized by its superblock
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilesystemKind {
    /// ext2, ext3 or ext4
    Ext,

    /// FAT12, FAT16 or FAT32
    Fat,

    /// ISO 9660
    Iso9660,

    /// SquashFS
    Squashfs,

    /// XFS
    Xfs,

    /// Btrfs
    Btrfs,
}

impl FilesystemKind {
    /// Returns the name `mount(8)` expects for this filesystem
    #[must_use]
    pub fn mount_type(self) -> &'static str {
        match self {
            Self::Ext => "ext4",
            Self::Fat => "vfat",
            Self::Iso9660 => "iso9660",
            Self::Squashfs => "squashfs",
            Self::Xfs => "xfs",
            Self::Btrfs => "btrfs",
        }
    }

    /// Parses a name previously returned by [`FilesystemKind::mount_type`]
    #[must_use]
    pub fn from_mount_type(s: &str) -> Option<Self> {
        Some(match s {
            "ext2" | "ext3" | "ext4" => Self::Ext,
            "vfat" | "fat" | "msdos" => Self::Fat,
            "iso9660" => Self::Iso9660,
            "squashfs" => Self::Squashfs,
            "xfs" => Self::Xfs,
            "btrfs" => Self::Btrfs,
            _ => return None,
        })
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mount_type())
    }
}

/// What the start of an image looks like
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImageLayout {
    /// The image is a whole disk with a partition table.
    ///
    /// The list only contains partitions that could hold a filesystem, and
    /// might be empty.
    Partitioned {
        /// Partition table type
        table: TableKind,

        /// Usable partitions, in table order
        partitions: Vec<Partition>,
    },

    /// The image is a bare filesystem
    Filesystem(FilesystemKind),

    /// Nothing we know about
    Unknown,
}

fn read_at<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    len: usize,
) -> io::Result<Option<Vec<u8>>> {
    if i64::try_from(offset).is_err() {
        trace!("Offset {offset} is out of range");
        return Ok(None);
    }

    reader.seek(SeekFrom::Start(offset))?;

    let mut buf = vec![0u8; len];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(Some(buf)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            trace!("Image too short to read {len} bytes at offset {offset}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn le_u32(buf: &[u8], offset: usize) -> u32 {
    buf.get(offset..offset + 4)
        .and_then(|s| <[u8; 4]>::try_from(s).ok())
        .map_or(0, u32::from_le_bytes)
}

fn le_u64(buf: &[u8], offset: usize) -> u64 {
    buf.get(offset..offset + 8)
        .and_then(|s| <[u8; 8]>::try_from(s).ok())
        .map_or(0, u64::from_le_bytes)
}

fn has_magic<R: Read + Seek>(reader: &mut R, offset: u64, magic: &[u8]) -> io::Result<bool> {
    Ok(read_at(reader, offset, magic.len())?.is_some_and(|b| b == magic))
}

fn is_fat_boot_sector(sector: &[u8]) -> bool {
    let jump = sector.first().is_some_and(|b| *b == 0xeb || *b == 0xe9);
    let label = |off: usize| sector.get(off..off + 3).is_some_and(|l| l == b"FAT");

    jump && (label(FAT16_LABEL_OFFSET) || label(FAT32_LABEL_OFFSET))
}

fn has_mbr_signature(sector: &[u8]) -> bool {
    sector.get(MBR_SIGNATURE_OFFSET..MBR_SIGNATURE_OFFSET + 2) == Some(&MBR_SIGNATURE[..])
}

fn parse_mbr_partitions(sector: &[u8]) -> Vec<Partition> {
    let mut partitions = Vec::new();

    for idx in 0..MBR_PART_ENTRY_NUM {
        let start = MBR_PART_ENTRY_OFFSET_BYTES + MBR_PART_ENTRY_SIZE_BYTES * idx;
        let Some(entry) = sector.get(start..start + MBR_PART_ENTRY_SIZE_BYTES) else {
            break;
        };

        let part_type = entry[4];
        let start_lba = u64::from(le_u32(entry, 8));
        let size_lba = u64::from(le_u32(entry, 12));

        trace!("MBR entry {idx}: type {part_type:#x}, start {start_lba}, size {size_lba}");

        if part_type == 0 || size_lba == 0 {
            continue;
        }

        if part_type == MBR_TYPE_GPT_PROTECTIVE || MBR_TYPES_EXTENDED.contains(&part_type) {
            debug!("Skipping MBR entry {idx} of type {part_type:#x}");
            continue;
        }

        partitions.push(Partition {
            number: idx + 1,
            start_lba,
            size_lba,
            kind: PartitionType::Mbr(part_type),
        });
    }

    partitions
}

fn image_len<R: Seek>(reader: &mut R) -> io::Result<u64> {
    reader.seek(SeekFrom::End(0))
}

/// Whether the partition starts within an image of the given length
fn starts_within(part: &Partition, image_len: u64) -> bool {
    part.start_lba
        .checked_mul(LBA_SIZE)
        .is_some_and(|offset| offset < image_len)
}

fn parse_gpt_partitions<R: Read + Seek>(
    reader: &mut R,
    header: &[u8],
    image_len: u64,
) -> io::Result<Vec<Partition>> {
    let entries_lba = le_u64(header, 72);
    let num_entries = u64::from(le_u32(header, 80)).min(GPT_MAX_ENTRIES);
    let entry_size = u64::from(le_u32(header, 84));

    debug!("GPT has {num_entries} entries of {entry_size} bytes at LBA {entries_lba}");

    if entry_size < GPT_MIN_ENTRY_SIZE
        || entry_size > GPT_MAX_ENTRY_SIZE
        || entry_size % GPT_MIN_ENTRY_SIZE != 0
    {
        debug!("Invalid GPT entry size, ignoring the table content");
        return Ok(Vec::new());
    }

    // Both factors are bounded, this can't overflow.
    let table_len = num_entries * entry_size;

    let range = entries_lba
        .checked_mul(LBA_SIZE)
        .and_then(|start| start.checked_add(table_len).map(|end| (start, end)));
    let Some((table_start, table_end)) = range else {
        debug!("GPT entries offset is out of range");
        return Ok(Vec::new());
    };

    if table_end > image_len {
        debug!("GPT entries are past the end of the image");
        return Ok(Vec::new());
    }

    let (Ok(table_len), Ok(entry_size)) = (usize::try_from(table_len), usize::try_from(entry_size))
    else {
        return Ok(Vec::new());
    };

    let Some(table) = read_at(reader, table_start, table_len)? else {
        debug!("GPT entries are past the end of the image");
        return Ok(Vec::new());
    };

    let mut partitions = Vec::new();
    for (idx, entry) in table.chunks_exact(entry_size).enumerate() {
        let mut type_guid = [0u8; 16];
        type_guid.copy_from_slice(&entry[0..16]);

        if type_guid == [0u8; 16] {
            continue;
        }

        let first_lba = le_u64(entry, 32);
        let last_lba = le_u64(entry, 40);

        if last_lba < first_lba {
            debug!("GPT entry {idx} ends before it starts, skipping");
            continue;
        }

        let Some(size_lba) = (last_lba - first_lba).checked_add(1) else {
            debug!("GPT entry {idx} is too large, skipping");
            continue;
        };

        trace!("GPT entry {idx}: LBA {first_lba} to {last_lba}");

        let part = Partition {
            number: idx + 1,
            start_lba: first_lba,
            size_lba,
            kind: PartitionType::Gpt(type_guid),
        };

        if !starts_within(&part, image_len) {
            debug!("GPT entry {idx} starts past the end of the image, skipping");
            continue;
        }

        partitions.push(part);
    }

    Ok(partitions)
}

/// Looks for a filesystem superblock starting at the given offset
///
/// # Errors
///
/// If reading from the underlying reader fails
pub fn probe_filesystem<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
) -> io::Result<Option<FilesystemKind>> {
    if let Some(sector) = read_at(reader, offset, 512)? {
        if is_fat_boot_sector(&sector) && has_mbr_signature(&sector) {
            return Ok(Some(FilesystemKind::Fat));
        }

        if sector.starts_with(XFS_MAGIC) {
            return Ok(Some(FilesystemKind::Xfs));
        }

        if sector.starts_with(SQUASHFS_MAGIC) {
            return Ok(Some(FilesystemKind::Squashfs));
        }
    }

    for (magic_offset, magic, kind) in [
        (EXT_MAGIC_OFFSET, &EXT_MAGIC[..], FilesystemKind::Ext),
        (BTRFS_MAGIC_OFFSET, &BTRFS_MAGIC[..], FilesystemKind::Btrfs),
        (ISO9660_MAGIC_OFFSET, &ISO9660_MAGIC[..], FilesystemKind::Iso9660),
    ] {
        let Some(at) = offset.checked_add(magic_offset) else {
            trace!("Superblock offset past {offset} is out of range");
            return Ok(None);
        };

        if has_magic(reader, at, magic)? {
            return Ok(Some(kind));
        }
    }

    Ok(None)
}

/// Probes the layout of an image
///
/// # Errors
///
/// If reading from the underlying reader fails
pub fn probe<R: Read + Seek>(reader: &mut R) -> io::Result<ImageLayout> {
    let Some(mbr) = read_at(reader, 0, 512)? else {
        debug!("Image is smaller than a block");
        return Ok(ImageLayout::Unknown);
    };

    let image_len = image_len(reader)?;

    if let Some(header) = read_at(reader, GPT_HEADER_LBA * LBA_SIZE, 92)? {
        if header.starts_with(GPT_SIGNATURE_HEADER) {
            debug!("Found a GPT header");

            let partitions = parse_gpt_partitions(reader, &header, image_len)?;
            return Ok(ImageLayout::Partitioned {
                table: TableKind::Gpt,
                partitions,
            });
        }
    }

    // A FAT boot sector carries the same signature as an MBR.
    if has_mbr_signature(&mbr) && !is_fat_boot_sector(&mbr) {
        debug!("Found an MBR signature");

        return Ok(ImageLayout::Partitioned {
            table: TableKind::Mbr,
            partitions: parse_mbr_partitions(&mbr)
                .into_iter()
                .filter(|p| starts_within(p, image_len))
                .collect(),
        });
    }

    Ok(match probe_filesystem(reader, 0)? {
        Some(fs) => {
            debug!("Found a bare {fs} filesystem");
            ImageLayout::Filesystem(fs)
        }
        None => ImageLayout::Unknown,
    })
}

/// Probes the layout of an image file
///
/// # Errors
///
/// If the file can't be opened or read
pub fn probe_file(path: &Path) -> io::Result<ImageLayout> {
    debug!("Probing {}", path.display());

    let mut reader = BufReader::new(File::open(path)?);
    probe(&mut reader)
}

/// Probes the filesystem held by a partition of an image file
///
/// # Errors
///
/// If the file can't be opened or read
pub fn probe_partition_file(path: &Path, part: &Partition) -> io::Result<Option<FilesystemKind>> {
    let mut reader = BufReader::new(File::open(path)?);
    probe_filesystem(&mut reader, part.offset_bytes())
}
