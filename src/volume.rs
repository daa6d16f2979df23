//! Read-only access to the NTFS structures that carry the volume geometry:
//! the boot sector and the `$DATA` attribute of MFT record 0.

use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::mem::size_of;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::geometry::GeometryModel;

const BOOT_SECTOR_SIZE: usize = 512;
const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";
const END_OF_SECTOR_MARKER: u16 = 0xAA55;

/// Update sequence stride, independent of the device sector size.
const NTFS_BLOCK_SIZE: usize = 512;

const MAX_CLUSTER_SIZE_BITS: u8 = 21;
const MIN_MFT_RECORD_SIZE_BITS: u8 = 9;
const MAX_MFT_RECORD_SIZE_BITS: u8 = 16;

const MFT_RECORD_IN_USE: u16 = 0x0001;
const AT_DATA: u32 = 0x80;
const AT_END: u32 = 0xFFFF_FFFF;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        const RDONLY  = 0x0001;
        /// Fall back to `$MFTMirr` when MFT record 0 is unreadable.
        const RECOVER = 0x0002;
    }
}

#[derive(Debug)]
pub enum MountError {
    Io(io::Error),
    NotNtfs,
    InvalidBootSector(String),
    CorruptMftRecord(String),
    MissingMftData,
    ReadWriteUnsupported,
}

impl fmt::Display for MountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::NotNtfs => write!(f, "not an NTFS volume"),
            Self::InvalidBootSector(reason) => {
                write!(f, "invalid boot sector: {reason}")
            }
            Self::CorruptMftRecord(reason) => {
                write!(f, "corrupt MFT record 0: {reason}")
            }
            Self::MissingMftData => {
                write!(f, "MFT record 0 has no unnamed $DATA attribute")
            }
            Self::ReadWriteUnsupported => {
                write!(f, "volumes can only be mounted read-only")
            }
        }
    }
}

impl Error for MountError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for MountError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

fn corrupt(reason: &str) -> MountError {
    MountError::CorruptMftRecord(reason.into())
}

fn invalid(reason: String) -> MountError {
    MountError::InvalidBootSector(reason)
}

#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C)]
struct NtfsBootSector {
    _jump: [u8; 3],
    oem_id: [u8; 8],
    bytes_per_sector: U16,
    sectors_per_cluster: u8,
    _bpb: [u8; 26],
    number_of_sectors: U64,
    mft_lcn: U64,
    mftmirr_lcn: U64,
    clusters_per_mft_record: i8,
    _bootstrap: [u8; 445],
    end_of_sector_marker: U16,
}

const _: () = assert!(size_of::<NtfsBootSector>() == BOOT_SECTOR_SIZE);

#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C)]
struct MftRecordHeader {
    magic: [u8; 4],
    usa_ofs: U16,
    usa_count: U16,
    _lsn: U64,
    _sequence_number: U16,
    _link_count: U16,
    attrs_offset: U16,
    flags: U16,
    bytes_in_use: U32,
}

#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C)]
struct AttrRecordHeader {
    type_code: U32,
    length: U32,
    non_resident: u8,
    name_length: u8,
    _name_offset: U16,
    _flags: U16,
    _instance: U16,
}

#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C)]
struct NonResidentAttr {
    lowest_vcn: U64,
    _highest_vcn: U64,
    _mapping_pairs_offset: U16,
    _compression_unit: u8,
    _reserved: [u8; 5],
    _allocated_size: U64,
    _data_size: U64,
    initialized_size: U64,
}

#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C)]
struct ResidentAttr {
    value_length: U32,
    _value_offset: U16,
    _flags: u8,
    _reserved: u8,
}

/// Boot sector values after validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BootParams {
    sector_size_bits: u8,
    cluster_size_bits: u8,
    nr_clusters: u64,
    mft_lcn: u64,
    mftmirr_lcn: u64,
    mft_record_size_bits: u8,
}

#[allow(clippy::cast_possible_truncation)]
const fn log2(value: u64) -> u8 {
    value.trailing_zeros() as u8
}

impl BootParams {
    fn parse(sector: &[u8]) -> Result<Self, MountError> {
        let boot = NtfsBootSector::read_from_bytes(sector).map_err(|_| {
            invalid(format!("short read of {} bytes", sector.len()))
        })?;

        if &boot.oem_id != NTFS_OEM_ID {
            return Err(MountError::NotNtfs);
        }

        if boot.end_of_sector_marker.get() != END_OF_SECTOR_MARKER {
            warn!("boot sector end marker is missing");
        }

        let bytes_per_sector = u64::from(boot.bytes_per_sector.get());
        if !bytes_per_sector.is_power_of_two()
            || !(256..=4096).contains(&bytes_per_sector)
        {
            return Err(invalid(format!(
                "unsupported bytes per sector: {bytes_per_sector}"
            )));
        }
        let sector_size_bits = log2(bytes_per_sector);

        // Values above 0x80 encode the shift as a negative number.
        let spc = boot.sectors_per_cluster;
        let cluster_shift = match spc {
            1..=0x80 if spc.is_power_of_two() => log2(u64::from(spc)),
            0x81..=0xFF => spc.wrapping_neg(),
            _ => {
                return Err(invalid(format!(
                    "unsupported sectors per cluster: {spc}"
                )))
            }
        };

        let cluster_size_bits = sector_size_bits + cluster_shift;
        if cluster_size_bits > MAX_CLUSTER_SIZE_BITS {
            return Err(invalid(format!(
                "cluster size 2^{cluster_size_bits} is too large"
            )));
        }

        let nr_clusters = boot.number_of_sectors.get() >> cluster_shift;
        if nr_clusters.leading_zeros() < u32::from(cluster_size_bits) {
            return Err(invalid(format!(
                "volume of {nr_clusters} clusters overflows 64 bits"
            )));
        }

        let cpr = boot.clusters_per_mft_record;
        let mft_record_size_bits = match cpr {
            1..=i8::MAX if cpr.unsigned_abs().is_power_of_two() => {
                cluster_size_bits + log2(u64::from(cpr.unsigned_abs()))
            }
            i8::MIN..=-1 => cpr.unsigned_abs(),
            _ => {
                return Err(invalid(format!(
                    "unsupported clusters per MFT record: {cpr}"
                )))
            }
        };

        if !(MIN_MFT_RECORD_SIZE_BITS..=MAX_MFT_RECORD_SIZE_BITS)
            .contains(&mft_record_size_bits)
        {
            return Err(invalid(format!(
                "unsupported MFT record size 2^{mft_record_size_bits}"
            )));
        }

        let mft_lcn = boot.mft_lcn.get();
        let mftmirr_lcn = boot.mftmirr_lcn.get();

        if mft_lcn >= nr_clusters || mftmirr_lcn >= nr_clusters {
            return Err(invalid(format!(
                "MFT at cluster {mft_lcn} or MFT mirror at cluster \
                 {mftmirr_lcn} lies beyond {nr_clusters} clusters"
            )));
        }

        Ok(Self {
            sector_size_bits,
            cluster_size_bits,
            nr_clusters,
            mft_lcn,
            mftmirr_lcn,
            mft_record_size_bits,
        })
    }

    const fn mft_record_size(&self) -> usize {
        1 << self.mft_record_size_bits
    }

    /// Byte offset of a cluster, failing if it does not fit into `u64`.
    fn cluster_offset(&self, lcn: u64) -> Result<u64, MountError> {
        let shift = self.cluster_size_bits;

        if lcn.leading_zeros() < u32::from(shift) {
            return Err(invalid(format!(
                "byte offset of cluster {lcn} overflows 64 bits"
            )));
        }

        Ok(lcn << shift)
    }
}

/// A mounted NTFS volume. The device stays open until the volume is
/// dropped.
#[derive(Debug)]
pub struct Volume {
    device: PathBuf,
    _file: File,
    boot: BootParams,
    mft_initialized_size: u64,
}

impl Volume {
    /// Opens `device` and reads the attributes that describe its geometry.
    ///
    /// # Errors
    ///
    /// Returns an error if `flags` lacks [`MountFlags::RDONLY`], if the
    /// device cannot be read, or if the boot sector or MFT record 0 do not
    /// describe a usable NTFS volume.
    pub fn mount<P>(device: P, flags: MountFlags) -> Result<Self, MountError>
    where
        P: AsRef<Path>,
    {
        let device = device.as_ref();

        if !flags.contains(MountFlags::RDONLY) {
            return Err(MountError::ReadWriteUnsupported);
        }

        debug!("mounting {} with {:?}", device.display(), flags);

        let mut file = File::open(device)?;

        let mut sector = [0_u8; BOOT_SECTOR_SIZE];
        file.read_exact(&mut sector)?;

        let boot = BootParams::parse(&sector)?;
        debug!("boot sector: {:?}", boot);

        let record = read_mft_record_zero(&mut file, &boot, flags)?;
        let mft_initialized_size = mft_data_initialized_size(&record)?;

        info!(
            "mounted {} read-only: {} clusters, $MFT initialized {} bytes",
            device.display(),
            boot.nr_clusters,
            mft_initialized_size
        );

        Ok(Self {
            device: device.into(),
            _file: file,
            boot,
            mft_initialized_size,
        })
    }

    #[must_use]
    pub fn device(&self) -> &Path {
        &self.device
    }

    #[must_use]
    pub const fn geometry(&self) -> GeometryModel {
        GeometryModel {
            sector_size_bits: self.boot.sector_size_bits,
            cluster_size_bits: self.boot.cluster_size_bits,
            cluster_count: self.boot.nr_clusters,
            metadata_record_size_bits: self.boot.mft_record_size_bits,
            metadata_region_initialized_bytes: self.mft_initialized_size,
        }
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        debug!("unmounting {}", self.device.display());
    }
}

fn read_mft_record_zero(
    file: &mut File,
    boot: &BootParams,
    flags: MountFlags,
) -> Result<Vec<u8>, MountError> {
    match read_mft_record(file, boot, boot.mft_lcn) {
        Err(MountError::CorruptMftRecord(reason))
            if flags.contains(MountFlags::RECOVER) =>
        {
            warn!("$MFT record 0 is unusable ({reason}), trying $MFTMirr");
            read_mft_record(file, boot, boot.mftmirr_lcn)
        }
        result => result,
    }
}

fn read_mft_record(
    file: &mut File,
    boot: &BootParams,
    lcn: u64,
) -> Result<Vec<u8>, MountError> {
    let mut record = vec![0_u8; boot.mft_record_size()];

    file.seek(SeekFrom::Start(boot.cluster_offset(lcn)?))?;
    file.read_exact(&mut record)?;

    apply_fixups(&mut record)?;

    Ok(record)
}

/// Verifies the update sequence of a multi-sector record and restores the
/// bytes it replaced at the end of each 512 byte block.
fn apply_fixups(record: &mut [u8]) -> Result<(), MountError> {
    let (header, _) = MftRecordHeader::read_from_prefix(record)
        .map_err(|_| corrupt("record shorter than its header"))?;

    match &header.magic {
        b"FILE" => {}
        b"BAAD" => return Err(corrupt("record is marked bad")),
        _ => return Err(corrupt("bad magic")),
    }

    let usa_ofs = usize::from(header.usa_ofs.get());
    let usa_count = usize::from(header.usa_count.get());

    if usa_count != record.len() / NTFS_BLOCK_SIZE + 1
        || usa_ofs % 2 != 0
        || usa_ofs + usa_count * 2 > NTFS_BLOCK_SIZE - 2
    {
        return Err(corrupt("bad update sequence array"));
    }

    let usn = [record[usa_ofs], record[usa_ofs + 1]];

    for block in 1..usa_count {
        let tail = block * NTFS_BLOCK_SIZE - 2;

        if record[tail..tail + 2] != usn {
            return Err(corrupt("update sequence mismatch"));
        }

        let saved = usa_ofs + block * 2;
        record.copy_within(saved..saved + 2, tail);
    }

    Ok(())
}

/// Returns the initialized size of the unnamed `$DATA` attribute.
fn mft_data_initialized_size(record: &[u8]) -> Result<u64, MountError> {
    let (header, _) = MftRecordHeader::read_from_prefix(record)
        .map_err(|_| corrupt("record shorter than its header"))?;

    if header.flags.get() & MFT_RECORD_IN_USE == 0 {
        return Err(corrupt("record is not in use"));
    }

    let end = record.len().min(header.bytes_in_use.get() as usize);
    let mut pos = usize::from(header.attrs_offset.get());

    loop {
        let rest = record
            .get(pos..end)
            .ok_or_else(|| corrupt("attribute beyond bytes in use"))?;

        let (type_code, _) = U32::read_from_prefix(rest)
            .map_err(|_| corrupt("truncated attribute list"))?;

        if type_code.get() == AT_END {
            return Err(MountError::MissingMftData);
        }

        let (attr, body) = AttrRecordHeader::read_from_prefix(rest)
            .map_err(|_| corrupt("truncated attribute header"))?;

        let length = attr.length.get() as usize;
        if length < size_of::<AttrRecordHeader>() || length > rest.len() {
            return Err(corrupt("bad attribute length"));
        }

        if attr.type_code.get() == AT_DATA && attr.name_length == 0 {
            if attr.non_resident == 0 {
                let (value, _) = ResidentAttr::read_from_prefix(body)
                    .map_err(|_| corrupt("truncated resident $DATA"))?;

                return Ok(u64::from(value.value_length.get()));
            }

            let (value, _) = NonResidentAttr::read_from_prefix(body)
                .map_err(|_| corrupt("truncated non-resident $DATA"))?;

            if value.lowest_vcn.get() == 0 {
                return Ok(value.initialized_size.get());
            }
        }

        pos += length;
    }
}
