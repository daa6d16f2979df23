#![deny(clippy::all)]
#![warn(clippy::pedantic, clippy::nursery, clippy::cargo)]

//! Derives and reports the geometry of an NTFS volume: sector, cluster and
//! volume sizes plus the number of initialized MFT records.

pub mod geometry;
pub mod report;
pub mod volume;

pub use geometry::{
    derive, derive_with, GeometryError, GeometryModel, GeometryReport,
    MetadataAlignment,
};
pub use volume::{MountError, MountFlags, Volume};
