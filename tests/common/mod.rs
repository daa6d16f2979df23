#![allow(dead_code)]

use std::io::{Seek, SeekFrom, Write};

use tempfile::NamedTempFile;

const BLOCK_SIZE: usize = 512;
const USA_OFS: usize = 0x30;

/// A minimal NTFS image: a boot sector plus MFT record 0 in `$MFT` and
/// `$MFTMirr`. Everything else is left sparse.
#[derive(Clone, Debug)]
pub struct Image {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mftmirr_lcn: u64,
    pub clusters_per_mft_record: i8,
    pub mft_initialized_size: u64,
    pub corrupt_mft: bool,
}

impl Default for Image {
    fn default() -> Self {
        Self {
            bytes_per_sector: 512,
            sectors_per_cluster: 8,
            total_sectors: 8000,
            mft_lcn: 4,
            mftmirr_lcn: 2,
            clusters_per_mft_record: -10,
            mft_initialized_size: 10240,
            corrupt_mft: false,
        }
    }
}

impl Image {
    fn cluster_size(&self) -> u64 {
        u64::from(self.bytes_per_sector) * u64::from(self.sectors_per_cluster)
    }

    fn record_size(&self) -> usize {
        1 << self.clusters_per_mft_record.unsigned_abs()
    }

    pub fn boot_sector(&self) -> [u8; 512] {
        let mut sector = [0_u8; 512];
        sector[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        sector[3..11].copy_from_slice(b"NTFS    ");
        let bytes_per_sector = self.bytes_per_sector.to_le_bytes();
        sector[0x0B..0x0D].copy_from_slice(&bytes_per_sector);
        sector[0x0D] = self.sectors_per_cluster;
        sector[0x28..0x30].copy_from_slice(&self.total_sectors.to_le_bytes());
        sector[0x30..0x38].copy_from_slice(&self.mft_lcn.to_le_bytes());
        sector[0x38..0x40].copy_from_slice(&self.mftmirr_lcn.to_le_bytes());
        sector[0x40] = self.clusters_per_mft_record.to_le_bytes()[0];
        sector[0x1FE..].copy_from_slice(&[0x55, 0xAA]);
        sector
    }

    /// MFT record 0 as stored on disk, update sequence applied.
    pub fn mft_record(&self) -> Vec<u8> {
        let size = self.record_size();
        let usa_count = size / BLOCK_SIZE + 1;
        let attrs_offset = (USA_OFS + usa_count * 2 + 7) & !7;

        let mut record = vec![0_u8; size];
        record[0..4].copy_from_slice(b"FILE");
        put_u16(&mut record, 0x04, USA_OFS);
        put_u16(&mut record, 0x06, usa_count);
        put_u16(&mut record, 0x10, 1); // sequence number
        put_u16(&mut record, 0x12, 1); // link count
        put_u16(&mut record, 0x14, attrs_offset);
        put_u16(&mut record, 0x16, 1); // in use
        put_u32(&mut record, 0x1C, size);

        // unnamed, non-resident $DATA
        let data = attrs_offset;
        let allocated = self
            .mft_initialized_size
            .next_multiple_of(self.cluster_size());
        put_u32(&mut record, data, 0x80);
        put_u32(&mut record, data + 0x04, 0x48);
        record[data + 0x08] = 1;
        put_u16(&mut record, data + 0x20, 0x40);
        put_u64(&mut record, data + 0x18, allocated / self.cluster_size());
        put_u64(&mut record, data + 0x28, allocated);
        put_u64(&mut record, data + 0x30, self.mft_initialized_size);
        put_u64(&mut record, data + 0x38, self.mft_initialized_size);
        record[data + 0x40..data + 0x43].copy_from_slice(&[0x11, 0x10, 0x04]);

        let end = data + 0x48;
        put_u32(&mut record, end, 0xFFFF_FFFF);
        put_u32(&mut record, 0x18, end + 8);

        let usn = [0x01, 0x00];
        record[USA_OFS..USA_OFS + 2].copy_from_slice(&usn);
        for block in 1..usa_count {
            let tail = block * BLOCK_SIZE - 2;
            let saved = USA_OFS + block * 2;
            record.copy_within(tail..tail + 2, saved);
            record[tail..tail + 2].copy_from_slice(&usn);
        }

        record
    }

    pub fn write(&self) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();

        let len = self.total_sectors * u64::from(self.bytes_per_sector);
        file.as_file().set_len(len).unwrap();

        file.write_all(&self.boot_sector()).unwrap();

        let record = self.mft_record();

        let mut mft = record.clone();
        if self.corrupt_mft {
            let tail = BLOCK_SIZE - 2;
            mft[tail..tail + 2].copy_from_slice(&[0xEE, 0xEE]);
        }

        self.write_at(&mut file, self.mft_lcn, &mft);
        self.write_at(&mut file, self.mftmirr_lcn, &record);

        file.flush().unwrap();
        file
    }

    fn write_at(&self, file: &mut NamedTempFile, lcn: u64, bytes: &[u8]) {
        file.seek(SeekFrom::Start(lcn * self.cluster_size())).unwrap();
        file.write_all(bytes).unwrap();
    }
}

fn put_u16(buf: &mut [u8], at: usize, value: usize) {
    let value = u16::try_from(value).unwrap();
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: usize) {
    let value = u32::try_from(value).unwrap();
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
