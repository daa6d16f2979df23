use std::error::Error;
use std::fmt;

/// Largest shift amount that is meaningful in the `u64` domain.
pub const MAX_SHIFT: u8 = 63;

/// Primary volume attributes, as exposed by a mounted volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeometryModel {
    /// log2 of bytes per sector.
    pub sector_size_bits: u8,
    /// log2 of bytes per cluster.
    pub cluster_size_bits: u8,
    /// Total clusters in the volume.
    pub cluster_count: u64,
    /// log2 of bytes per metadata record.
    pub metadata_record_size_bits: u8,
    /// Bytes of the metadata region that are initialized.
    pub metadata_region_initialized_bytes: u64,
}

/// How to treat an initialized metadata region that is not a whole number
/// of records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MetadataAlignment {
    /// Report [`GeometryError::MisalignedMetadataRegion`].
    #[default]
    Strict,
    /// Floor-divide and drop the partial record.
    Truncate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryError {
    /// Cluster smaller than sector, or a size exponent beyond [`MAX_SHIFT`].
    InvalidGeometry {
        sector_size_bits: u8,
        cluster_size_bits: u8,
        metadata_record_size_bits: u8,
    },
    /// Scaling `value` up by `2^shift` does not fit into `u64`.
    Overflow { value: u64, shift: u8 },
    MisalignedMetadataRegion {
        initialized_bytes: u64,
        record_size: u64,
    },
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidGeometry {
                sector_size_bits,
                cluster_size_bits,
                metadata_record_size_bits,
            } => write!(
                f,
                "invalid geometry: sector bits {sector_size_bits}, \
                 cluster bits {cluster_size_bits}, \
                 record bits {metadata_record_size_bits}"
            ),
            Self::Overflow { value, shift } => write!(
                f,
                "overflow: {value} << {shift} does not fit in 64 bits"
            ),
            Self::MisalignedMetadataRegion {
                initialized_bytes,
                record_size,
            } => write!(
                f,
                "initialized metadata region of {initialized_bytes} bytes \
                 is not a multiple of the {record_size} byte record size"
            ),
        }
    }
}

impl Error for GeometryError {}

/// Metrics derived from a [`GeometryModel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeometryReport {
    bytes_per_sector: u64,
    bytes_per_cluster: u64,
    sectors_per_cluster: u64,
    total_volume_bytes: u64,
    total_sectors: u64,
    total_clusters: u64,
    initialized_metadata_records: u64,
}

impl GeometryReport {
    #[must_use]
    pub const fn bytes_per_sector(&self) -> u64 {
        self.bytes_per_sector
    }

    #[must_use]
    pub const fn bytes_per_cluster(&self) -> u64 {
        self.bytes_per_cluster
    }

    #[must_use]
    pub const fn sectors_per_cluster(&self) -> u64 {
        self.sectors_per_cluster
    }

    #[must_use]
    pub const fn total_volume_bytes(&self) -> u64 {
        self.total_volume_bytes
    }

    #[must_use]
    pub const fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    #[must_use]
    pub const fn total_clusters(&self) -> u64 {
        self.total_clusters
    }

    #[must_use]
    pub const fn initialized_metadata_records(&self) -> u64 {
        self.initialized_metadata_records
    }
}

/// Derives the report, rejecting a misaligned metadata region.
///
/// # Errors
///
/// Returns [`GeometryError::InvalidGeometry`] if the cluster is smaller than
/// the sector or an exponent is out of range, [`GeometryError::Overflow`] if
/// the volume size does not fit into `u64`, and
/// [`GeometryError::MisalignedMetadataRegion`] if the initialized metadata
/// region is not a whole number of records.
pub fn derive(model: &GeometryModel) -> Result<GeometryReport, GeometryError> {
    derive_with(model, MetadataAlignment::Strict)
}

/// Derives the report with an explicit metadata alignment policy.
///
/// # Errors
///
/// Same as [`derive`], except that [`MetadataAlignment::Truncate`] never
/// returns [`GeometryError::MisalignedMetadataRegion`].
pub fn derive_with(
    model: &GeometryModel,
    alignment: MetadataAlignment,
) -> Result<GeometryReport, GeometryError> {
    let sb = model.sector_size_bits;
    let cb = model.cluster_size_bits;
    let rb = model.metadata_record_size_bits;

    if cb < sb || cb > MAX_SHIFT || rb > MAX_SHIFT {
        return Err(GeometryError::InvalidGeometry {
            sector_size_bits: sb,
            cluster_size_bits: cb,
            metadata_record_size_bits: rb,
        });
    }

    let cps = cb - sb;

    let bytes_per_sector = 1_u64 << sb;
    let bytes_per_cluster = 1_u64 << cb;
    let sectors_per_cluster = 1_u64 << cps;

    let total_volume_bytes = scale_up(model.cluster_count, cb)?;
    let total_sectors = scale_up(model.cluster_count, cps)?;

    let record_size = 1_u64 << rb;
    let initialized = model.metadata_region_initialized_bytes;

    if alignment == MetadataAlignment::Strict
        && initialized & (record_size - 1) != 0
    {
        return Err(GeometryError::MisalignedMetadataRegion {
            initialized_bytes: initialized,
            record_size,
        });
    }

    Ok(GeometryReport {
        bytes_per_sector,
        bytes_per_cluster,
        sectors_per_cluster,
        total_volume_bytes,
        total_sectors,
        total_clusters: model.cluster_count,
        initialized_metadata_records: initialized >> rb,
    })
}

/// Computes `value << shift`, failing if any set bit would be shifted out.
const fn scale_up(value: u64, shift: u8) -> Result<u64, GeometryError> {
    if shift > MAX_SHIFT || value.leading_zeros() < shift as u32 {
        Err(GeometryError::Overflow { value, shift })
    } else {
        Ok(value << shift)
    }
}
