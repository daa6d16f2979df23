use std::fmt::Write;

use anyhow::Result;

use crate::geometry::GeometryReport;

const LABEL_WIDTH: usize = 23;

/// Wide enough for `u64::MAX`.
const VALUE_WIDTH: usize = 20;

/// Converts a report to its fixed seven-line text form.
///
/// # Errors
///
/// This functions uses [`writeln`] to write to the output [`String`] that is
/// returned. It can only fail if any of these [`writeln`] fails.
pub fn to_text(report: &GeometryReport) -> Result<String> {
    let lines = [
        ("bytes per sector", report.bytes_per_sector()),
        ("bytes per cluster", report.bytes_per_cluster()),
        ("sectors per cluster", report.sectors_per_cluster()),
        ("bytes per volume", report.total_volume_bytes()),
        ("sectors per volume", report.total_sectors()),
        ("clusters per volume", report.total_clusters()),
        ("initialized mft records", report.initialized_metadata_records()),
    ];

    let mut output = String::default();

    for (label, value) in lines {
        writeln!(output, "{label:<LABEL_WIDTH$} : {value:>VALUE_WIDTH$}")?;
    }

    Ok(output)
}
