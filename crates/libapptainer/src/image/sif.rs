//! Just enough of the SIF container layout to find the root filesystem
//! partition.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use super::{ImageError, Result, RootFsType};

pub const SIF_MAGIC: &[u8] = b"SIF_MAGIC";
/// Offset of the magic, after the launch script area.
pub const MAGIC_OFFSET: u64 = 32;

const HEADER_LEN: usize = 128;
const DESCRIPTOR_LEN: usize = 585;
const DATA_PARTITION: i32 = 0x4004;
const PART_PRIM_SYS: i32 = 2;

const FS_SQUASH: i32 = 1;
const FS_EXT3: i32 = 2;
const FS_ENCRYPTED_SQUASHFS: i32 = 5;

/// Root filesystem partition of a SIF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub fs: RootFsType,
    pub offset: u64,
    pub size: u64,
}

/// Reads the primary system partition descriptor of a SIF image.
pub trait SifInspector {
    fn root_partition(&self, file: &mut File) -> Result<Partition>;
}

/// Parses the descriptor table of the file itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct DescriptorTable;

fn le_i64(b: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[at..at + 8]);
    i64::from_le_bytes(raw)
}

fn le_i32(b: &[u8], at: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&b[at..at + 4]);
    i32::from_le_bytes(raw)
}

impl SifInspector for DescriptorTable {
    fn root_partition(&self, file: &mut File) -> Result<Partition> {
        let mut header = [0u8; HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        if &header[32..32 + SIF_MAGIC.len()] != SIF_MAGIC {
            return Err(ImageError::NotSif);
        }
        // 64 bytes of launch, magic, version, arch and id come first
        let total = le_i64(&header, 64 + 24);
        let descr_offset = le_i64(&header, 64 + 32);
        if total <= 0 || descr_offset <= 0 {
            return Err(ImageError::NoRootFs);
        }

        let mut descriptors = vec![0u8; total as usize * DESCRIPTOR_LEN];
        file.seek(SeekFrom::Start(descr_offset as u64))?;
        file.read_exact(&mut descriptors)?;

        for d in descriptors.chunks_exact(DESCRIPTOR_LEN) {
            let used = d[4] != 0;
            if !used || le_i32(d, 0) != DATA_PARTITION {
                continue;
            }
            // fixed fields take 73 bytes, the name 128, then the extra area
            let extra = 73 + 128;
            if le_i32(d, extra + 4) != PART_PRIM_SYS {
                continue;
            }
            let fs = match le_i32(d, extra) {
                FS_SQUASH => RootFsType::Squashfs,
                FS_EXT3 => RootFsType::Ext3,
                FS_ENCRYPTED_SQUASHFS => RootFsType::EncryptedSquashfs,
                _ => RootFsType::Other,
            };
            return Ok(Partition {
                fs,
                offset: le_i64(d, 17) as u64,
                size: le_i64(d, 25) as u64,
            });
        }
        Err(ImageError::NoRootFs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::Write;

    /// Writes a SIF with one primary system partition of type `fs`.
    pub(crate) fn write_sif(path: &std::path::Path, fs: i32, payload: &[u8]) -> Result<()> {
        let mut header = vec![0u8; HEADER_LEN];
        header[32..32 + SIF_MAGIC.len()].copy_from_slice(SIF_MAGIC);
        let descr_offset = HEADER_LEN as i64;
        let data_offset = descr_offset + DESCRIPTOR_LEN as i64;
        header[88..96].copy_from_slice(&1i64.to_le_bytes());
        header[96..104].copy_from_slice(&descr_offset.to_le_bytes());

        let mut d = vec![0u8; DESCRIPTOR_LEN];
        d[0..4].copy_from_slice(&DATA_PARTITION.to_le_bytes());
        d[4] = 1;
        d[17..25].copy_from_slice(&data_offset.to_le_bytes());
        d[25..33].copy_from_slice(&(payload.len() as i64).to_le_bytes());
        d[201..205].copy_from_slice(&fs.to_le_bytes());
        d[205..209].copy_from_slice(&PART_PRIM_SYS.to_le_bytes());

        let mut f = File::create(path)?;
        f.write_all(&header)?;
        f.write_all(&d)?;
        f.write_all(payload)?;
        Ok(())
    }

    #[test]
    fn test_root_partition() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("img.sif");
        write_sif(&path, FS_ENCRYPTED_SQUASHFS, b"hsqs")?;
        let part = DescriptorTable.root_partition(&mut File::open(&path)?)?;
        assert_eq!(part.fs, RootFsType::EncryptedSquashfs);
        assert_eq!(part.offset, (HEADER_LEN + DESCRIPTOR_LEN) as u64);
        assert_eq!(part.size, 4);
        Ok(())
    }

    #[test]
    fn test_not_sif() -> Result<()> {
        let mut f = tempfile::tempfile()?;
        f.write_all(&[0u8; 256])?;
        assert!(matches!(
            DescriptorTable.root_partition(&mut f),
            Err(ImageError::NotSif)
        ));
        Ok(())
    }
}
