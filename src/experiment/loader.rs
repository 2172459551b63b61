//! CSV readers for protocol, coordinate and conversion-table files.
//!
//! Column headers are fixed; see [`ProtocolRow`] for the protocol columns.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{CharacError, CharacResult};
use crate::experiment::grid::ExplicitCoordinate;
use crate::experiment::intensity::{ConversionRow, ConversionTable};
use crate::experiment::protocol::{ProtocolRow, Sequence};
use crate::hardware::Position3;

#[derive(Debug, Deserialize)]
struct CoordinateRecord {
    #[serde(rename = "X-coordinate [mm]")]
    x: f64,
    #[serde(rename = "Y-coordinate [mm]")]
    y: f64,
    #[serde(rename = "Z-coordinate [mm]")]
    z: f64,
    #[serde(rename = "Measurement number", default)]
    measurement_number: Option<u32>,
    #[serde(rename = "Cluster number", default)]
    cluster_number: Option<u32>,
    #[serde(rename = "Indices number", default)]
    indices_number: Option<u32>,
    #[serde(rename = "Slice number", default)]
    slice: Option<u32>,
    #[serde(rename = "Row number", default)]
    row: Option<u32>,
    #[serde(rename = "Column number", default)]
    column: Option<u32>,
}

fn reader(path: &Path) -> CharacResult<csv::Reader<std::fs::File>> {
    Ok(csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?)
}

/// Read a protocol file.
///
/// Relative coordinate-file paths are resolved against `coordinates_dir`, or
/// against the protocol file's directory when it is `None`.
pub fn load_protocol_csv(path: &Path, coordinates_dir: Option<&Path>) -> CharacResult<Vec<Sequence>> {
    let base: PathBuf = match coordinates_dir {
        Some(dir) => dir.to_path_buf(),
        None => path.parent().map(Path::to_path_buf).unwrap_or_default(),
    };

    let mut sequences = Vec::new();
    for row in reader(path)?.deserialize::<ProtocolRow>() {
        let row = row?;
        let sequence = row.into_sequence(|file| {
            let resolved = if file.is_absolute() {
                file.to_path_buf()
            } else {
                base.join(file)
            };
            load_coordinates_csv(&resolved)
        })?;
        sequences.push(sequence);
    }
    debug!(path = %path.display(), sequences = sequences.len(), "Protocol loaded");
    Ok(sequences)
}

/// Read a coordinate file, preserving row order.
pub fn load_coordinates_csv(path: &Path) -> CharacResult<Vec<ExplicitCoordinate>> {
    let mut points = Vec::new();
    for record in reader(path)?.deserialize::<CoordinateRecord>() {
        let record = record?;
        points.push(ExplicitCoordinate {
            offset: Position3::new(record.x, record.y, record.z),
            measurement_number: record.measurement_number,
            cluster_number: record.cluster_number,
            indices_number: record.indices_number,
            slice: record.slice,
            row: record.row,
            column: record.column,
        });
    }
    if points.is_empty() {
        return Err(CharacError::InvalidGridSpec(format!(
            "coordinate file {} has no rows",
            path.display()
        )));
    }
    Ok(points)
}

/// Read an Isppa → global power calibration table.
pub fn load_conversion_table_csv(path: &Path) -> CharacResult<ConversionTable> {
    let rows = reader(path)?
        .deserialize::<ConversionRow>()
        .collect::<Result<Vec<_>, _>>()?;
    ConversionTable::new(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::grid::GridSpecification;
    use crate::experiment::intensity::DriveKind;
    use std::fs;
    use tempfile::TempDir;

    const HEADER: &str = "Sequence number,Tag,Modulation,Pulse duration [us],Pulse Repetition Interval [ms],Pulse Train Duration [ms],Focus [mm],Drive parameter,Corresponding value,Grid mode,Path and filename of coordinate file,max. + x [mm] w.r.t. relative zero,max. - x [mm] w.r.t. relative zero,max. + y [mm] w.r.t. relative zero,max. - y [mm] w.r.t. relative zero,step_size_x [mm],step_size_y [mm],step_size_z [mm]";

    #[test]
    fn loads_mixed_protocol() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("points.csv"),
            "X-coordinate [mm],Y-coordinate [mm],Z-coordinate [mm],Cluster number\n0,0,1,7\n0.5,0,1,7\n-0.5,0,1,8\n",
        )
        .unwrap();
        let protocol = dir.path().join("protocol.csv");
        fs::write(
            &protocol,
            format!(
                "{HEADER}\n\
                 2,scan,Square,20,1,5,40,Amplitude [%],20,Bounds,,1,1,1,1,1,1,1\n\
                 1,pts,Tukey,50,10,100,35,Isppa [W/cm2],3,Coordinates,points.csv,,,,,,,\n"
            ),
        )
        .unwrap();

        let sequences = load_protocol_csv(&protocol, None).unwrap();
        assert_eq!(sequences.len(), 2);
        assert_eq!(sequences[0].id, 2);
        assert!(matches!(sequences[0].grid, GridSpecification::BoundsAndSteps(_)));
        assert_eq!(sequences[1].drive_kind, DriveKind::Isppa);
        match &sequences[1].grid {
            GridSpecification::ExplicitCoordinates { points } => {
                assert_eq!(points.len(), 3);
                assert_eq!(points[1].offset, Position3::new(0.5, 0.0, 1.0));
                assert_eq!(points[2].cluster_number, Some(8));
            }
            other => panic!("unexpected grid {other:?}"),
        }
    }

    #[test]
    fn conversion_table_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("table.csv");
        fs::write(&path, "globalPower,intensity\n10,1\n42,5\n90,11\n").unwrap();
        let table = load_conversion_table_csv(&path).unwrap();
        assert_eq!(table.rows().len(), 3);
        assert_eq!(table.intensity_range(), (1.0, 11.0));
    }
}
