//! Result persistence.
//!
//! A [`ResultStore`] owns one run directory:
//!
//! ```text
//! <output_dir>/<run_name>_<YYYYmmdd_HHMMSS>[_NN]/
//!   run_manifest.json
//!   sequence_<id>_parameters.json
//!   sequence_<id>_waveforms.raw       little-endian f32, one record per stored point
//!   sequence_<id>_records.jsonl       one PointRecord per point, offsets into the raw file
//!   sequence_<id>_coordinates.csv     relative/absolute coordinates, status, phasor
//!   sequence_<id>_acd.raw             little-endian f32 amplitude/phase map, written at sequence end
//! ```
//!
//! Records are flushed as they are written so a crashed run leaves every point
//! measured so far on disk.
//!
//! The map file holds an array of shape `(2, slices, rows, columns)`: every
//! amplitude [V] in slice, row, column order, then every phase [rad] in the
//! same order. Grid slots with no stored phasor hold NaN.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::data::manifest::{RunManifest, RunStatus};
use crate::data::phasor::{self, Phasor};
use crate::error::CharacResult;
use crate::experiment::grid::{GridDimensions, GridIndex, GridSpecification};
use crate::experiment::measurement::{AcquisitionPlan, FaultRecord, MeasurementResult, PointStatus};
use crate::experiment::protocol::{DriveParameters, Sequence};
use crate::hardware::Position3;

/// File name of the manifest inside a run directory.
pub const MANIFEST_FILE: &str = "run_manifest.json";

const MAX_NAME_SUFFIX: u32 = 99;

/// Location of a stored record in the sequence's raw file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaveformRef {
    /// Byte offset of the first sample.
    pub offset_bytes: u64,
    /// Number of f32 samples.
    pub samples: usize,
    /// Sample interval [ns].
    pub sample_interval_ns: u64,
}

/// Per-point line of `sequence_<id>_records.jsonl`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub sequence_id: u32,
    pub index: GridIndex,
    pub measurement_number: u32,
    pub relative: Position3,
    pub absolute: Position3,
    pub status: PointStatus,
    pub attempts: u32,
    pub last_error: Option<FaultRecord>,
    pub captured_at: Option<DateTime<Utc>>,
    pub waveform: Option<WaveformRef>,
    pub phasor: Option<Phasor>,
}

#[derive(Serialize)]
struct SequenceParameters<'a> {
    sequence_id: u32,
    tag: &'a str,
    drive: &'a DriveParameters,
    acquisition: &'a AcquisitionPlan,
    grid: &'a GridSpecification,
    critical_points: &'a [usize],
    planned_points: usize,
    layout: GridDimensions,
}

#[cfg(feature = "storage_csv")]
#[derive(Serialize)]
struct CoordinateRow {
    #[serde(rename = "Measurement number")]
    measurement_number: u32,
    #[serde(rename = "Cluster number")]
    cluster_number: Option<u32>,
    #[serde(rename = "Indices number")]
    indices_number: Option<u32>,
    #[serde(rename = "X-coordinate [mm]")]
    x: f64,
    #[serde(rename = "Y-coordinate [mm]")]
    y: f64,
    #[serde(rename = "Z-coordinate [mm]")]
    z: f64,
    #[serde(rename = "Row number")]
    row: usize,
    #[serde(rename = "Column number")]
    column: usize,
    #[serde(rename = "Slice number")]
    slice: usize,
    #[serde(rename = "Absolute X-coordinate [mm]")]
    abs_x: f64,
    #[serde(rename = "Absolute Y-coordinate [mm]")]
    abs_y: f64,
    #[serde(rename = "Absolute Z-coordinate [mm]")]
    abs_z: f64,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Attempts")]
    attempts: u32,
    #[serde(rename = "Amplitude [V]")]
    amplitude: Option<f64>,
    #[serde(rename = "Phase [rad]")]
    phase: Option<f64>,
}

struct SequenceFiles {
    sequence_id: u32,
    operating_frequency_hz: f64,
    plan: AcquisitionPlan,
    layout: GridDimensions,
    amplitude_map: Vec<f32>,
    phase_map: Vec<f32>,
    raw: BufWriter<File>,
    raw_offset: u64,
    records: BufWriter<File>,
    #[cfg(feature = "storage_csv")]
    coordinates: csv::Writer<File>,
}

/// Writes one run's results and manifest.
pub struct ResultStore {
    run_dir: PathBuf,
    current: Option<SequenceFiles>,
}

impl ResultStore {
    /// Create a fresh run directory under `config.output_dir`.
    ///
    /// An existing directory of the same name is never reused; `_00` to `_99`
    /// are tried in turn.
    pub fn create(config: &StorageConfig) -> CharacResult<Self> {
        fs::create_dir_all(&config.output_dir)?;
        let base = format!(
            "{}_{}",
            config.run_name,
            Utc::now().format("%Y%m%d_%H%M%S")
        );

        let candidates = std::iter::once(base.clone())
            .chain((0..=MAX_NAME_SUFFIX).map(|n| format!("{}_{:02}", base, n)));
        for name in candidates {
            let run_dir = config.output_dir.join(&name);
            match fs::create_dir(&run_dir) {
                Ok(()) => {
                    info!(run_dir = %run_dir.display(), "Run directory created");
                    return Ok(Self {
                        run_dir,
                        current: None,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free run directory name for {}", base),
        )
        .into())
    }

    /// The run directory.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn sequence_path(&self, sequence_id: u32, suffix: &str) -> PathBuf {
        self.run_dir
            .join(format!("sequence_{}_{}", sequence_id, suffix))
    }

    /// Write a sequence's parameters and open its record files.
    ///
    /// `layout` sizes the amplitude/phase map written when the sequence ends.
    pub fn begin_sequence(
        &mut self,
        sequence: &Sequence,
        drive: &DriveParameters,
        plan: &AcquisitionPlan,
        layout: GridDimensions,
        planned_points: usize,
    ) -> CharacResult<()> {
        self.end_sequence()?;

        let parameters = SequenceParameters {
            sequence_id: sequence.id,
            tag: &sequence.tag,
            drive,
            acquisition: plan,
            grid: &sequence.grid,
            critical_points: &sequence.critical_points,
            planned_points,
            layout,
        };
        let mut writer = BufWriter::new(File::create(self.sequence_path(sequence.id, "parameters.json"))?);
        serde_json::to_writer_pretty(&mut writer, &parameters)?;
        writer.flush()?;

        let open = |path: PathBuf| OpenOptions::new().create(true).append(true).open(path);
        let raw = BufWriter::new(open(self.sequence_path(sequence.id, "waveforms.raw"))?);
        let records = BufWriter::new(open(self.sequence_path(sequence.id, "records.jsonl"))?);
        #[cfg(feature = "storage_csv")]
        let coordinates = csv::Writer::from_path(self.sequence_path(sequence.id, "coordinates.csv"))?;

        self.current = Some(SequenceFiles {
            sequence_id: sequence.id,
            operating_frequency_hz: drive.operating_frequency_hz,
            plan: plan.clone(),
            layout,
            amplitude_map: vec![f32::NAN; layout.total()],
            phase_map: vec![f32::NAN; layout.total()],
            raw,
            raw_offset: 0,
            records,
            #[cfg(feature = "storage_csv")]
            coordinates,
        });
        debug!(sequence_id = sequence.id, "Sequence files opened");
        Ok(())
    }

    /// Persist one point and append it to the manifest.
    pub fn record(
        &mut self,
        result: &MeasurementResult,
        manifest: &mut RunManifest,
    ) -> CharacResult<PointRecord> {
        let files = match self.current.as_mut() {
            Some(files) if files.sequence_id == result.sequence_id => files,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no open files for sequence {}", result.sequence_id),
                )
                .into())
            }
        };

        let mut waveform_ref = None;
        let mut phasor_value = None;
        if let Some(waveform) = &result.waveform {
            for sample in &waveform.samples {
                files.raw.write_all(&sample.to_le_bytes())?;
            }
            files.raw.flush()?;
            waveform_ref = Some(WaveformRef {
                offset_bytes: files.raw_offset,
                samples: waveform.len(),
                sample_interval_ns: waveform.sample_interval.as_nanos() as u64,
            });
            files.raw_offset += (waveform.len() * std::mem::size_of::<f32>()) as u64;
            phasor_value = phasor::extract(
                &waveform.samples,
                files.plan.processing_range(result.point.index.column),
                waveform.sample_interval,
                files.operating_frequency_hz,
            );
        }
        if let (Some(p), Some(slot)) = (phasor_value, files.layout.slot(&result.point.index)) {
            files.amplitude_map[slot] = p.amplitude as f32;
            files.phase_map[slot] = p.phase_rad as f32;
        }

        let record = PointRecord {
            sequence_id: result.sequence_id,
            index: result.point.index,
            measurement_number: result.point.measurement_number,
            relative: result.point.offset,
            absolute: result.point.absolute,
            status: result.status,
            attempts: result.attempts,
            last_error: result.last_error.clone(),
            captured_at: result.captured_at,
            waveform: waveform_ref,
            phasor: phasor_value,
        };
        serde_json::to_writer(&mut files.records, &record)?;
        files.records.write_all(b"\n")?;
        files.records.flush()?;

        #[cfg(feature = "storage_csv")]
        {
            let point = &result.point;
            files.coordinates.serialize(CoordinateRow {
                measurement_number: point.measurement_number,
                cluster_number: point.cluster_number,
                indices_number: point.indices_number,
                x: round3(point.offset.x),
                y: round3(point.offset.y),
                z: round3(point.offset.z),
                row: point.index.row,
                column: point.index.column,
                slice: point.index.slice,
                abs_x: round3(point.absolute.x),
                abs_y: round3(point.absolute.y),
                abs_z: round3(point.absolute.z),
                status: result.status.to_string(),
                attempts: result.attempts,
                amplitude: phasor_value.map(|p| p.amplitude),
                phase: phasor_value.map(|p| p.phase_rad),
            })?;
            files.coordinates.flush()?;
        }

        manifest.record_point(result)?;
        Ok(record)
    }

    /// Flush and close the current sequence's files and write its map.
    pub fn end_sequence(&mut self) -> CharacResult<()> {
        if let Some(mut files) = self.current.take() {
            files.raw.flush()?;
            files.records.flush()?;
            #[cfg(feature = "storage_csv")]
            files.coordinates.flush()?;

            let path = self.sequence_path(files.sequence_id, "acd.raw");
            let mut writer = BufWriter::new(File::create(&path)?);
            for value in files.amplitude_map.iter().chain(&files.phase_map) {
                writer.write_all(&value.to_le_bytes())?;
            }
            writer.flush()?;
            debug!(
                sequence_id = files.sequence_id,
                slices = files.layout.slices,
                rows = files.layout.rows,
                columns = files.layout.columns,
                "Amplitude/phase map written"
            );
        }
        Ok(())
    }

    /// Write `manifest` atomically.
    pub fn write_manifest(&self, manifest: &RunManifest) -> CharacResult<()> {
        let path = self.run_dir.join(MANIFEST_FILE);
        let tmp = path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, manifest)?;
            writer.flush()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Close all files, set the terminal status, and write the manifest.
    pub fn finalize(
        &mut self,
        manifest: &mut RunManifest,
        status: RunStatus,
        reason: Option<String>,
    ) -> CharacResult<()> {
        let closed = self.end_sequence();
        manifest.finalize(status, reason)?;
        self.write_manifest(manifest)?;
        info!(
            status = %manifest.status,
            points = manifest.point_count(),
            run_dir = %self.run_dir.display(),
            "Run manifest finalized"
        );
        closed
    }
}

/// Read the point records of one sequence back from a run directory.
pub fn load_records(run_dir: &Path, sequence_id: u32) -> CharacResult<Vec<PointRecord>> {
    let path = run_dir.join(format!("sequence_{}_records.jsonl", sequence_id));
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            records.push(serde_json::from_str(&line)?);
        }
    }
    Ok(records)
}

/// Read a run manifest from a run directory.
pub fn load_manifest(run_dir: &Path) -> CharacResult<RunManifest> {
    let file = File::open(run_dir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[cfg(feature = "storage_csv")]
fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::grid::{ExplicitCoordinate, GridGenerator};
    use crate::experiment::protocol::tests::sequence;
    use crate::hardware::coordinator::EquipmentIds;
    use crate::hardware::Waveform;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            output_dir: dir.path().to_path_buf(),
            run_name: "unit".to_string(),
        }
    }

    #[test]
    fn run_directories_never_collide() {
        let dir = TempDir::new().unwrap();
        let a = ResultStore::create(&storage(&dir)).unwrap();
        let b = ResultStore::create(&storage(&dir)).unwrap();
        assert_ne!(a.run_dir(), b.run_dir());
        assert!(a.run_dir().is_dir() && b.run_dir().is_dir());
    }

    #[test]
    fn records_waveforms_with_offsets() {
        let dir = TempDir::new().unwrap();
        let mut store = ResultStore::create(&storage(&dir)).unwrap();
        let seq = sequence(
            3,
            GridSpecification::ExplicitCoordinates {
                points: vec![ExplicitCoordinate::at(0.0, 0.0, 0.0), ExplicitCoordinate::at(1.0, 0.0, 0.0)],
            },
        );
        let drive = Arc::new(DriveParameters::resolve(&seq, 500e3, None).unwrap());
        let plan = AcquisitionPlan::for_sequence(&Default::default(), &drive, None);
        let points = GridGenerator::resolve(&seq.grid, Position3::default()).unwrap();
        let layout = GridGenerator::layout(&seq.grid, &points).unwrap();
        let mut manifest = RunManifest::new(
            store.run_dir().to_path_buf(),
            Position3::default(),
            EquipmentIds::default(),
            false,
        );
        manifest.begin_sequence(3, &seq.tag, drive.drive, points.len()).unwrap();
        store.begin_sequence(&seq, &drive, &plan, layout, points.len()).unwrap();

        for point in &points {
            let result = MeasurementResult {
                sequence_id: 3,
                point: point.clone(),
                drive: Arc::clone(&drive),
                status: PointStatus::Success,
                attempts: 1,
                last_error: None,
                waveform: Some(Waveform::from_rate(vec![0.1; 8], 25e6)),
                captured_at: Some(Utc::now()),
            };
            store.record(&result, &mut manifest).unwrap();
        }
        store.finalize(&mut manifest, RunStatus::Completed, None).unwrap();

        let records = load_records(store.run_dir(), 3).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].waveform.unwrap().offset_bytes, 32);
        let raw = fs::read(store.run_dir().join("sequence_3_waveforms.raw")).unwrap();
        assert_eq!(raw.len(), 64);
        assert_eq!(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]), 0.1);

        let manifest = load_manifest(store.run_dir()).unwrap();
        assert_eq!(manifest.status, RunStatus::Completed);
        assert_eq!(manifest.point_count(), 2);
        assert!(store.run_dir().join("sequence_3_parameters.json").is_file());
    }

    fn f32_at(bytes: &[u8], i: usize) -> f32 {
        f32::from_le_bytes([bytes[4 * i], bytes[4 * i + 1], bytes[4 * i + 2], bytes[4 * i + 3]])
    }

    #[test]
    fn map_holds_phasors_by_grid_slot() {
        let dir = TempDir::new().unwrap();
        let mut store = ResultStore::create(&storage(&dir)).unwrap();
        let at_column = |x: f64, column: u32| ExplicitCoordinate {
            column: Some(column),
            ..ExplicitCoordinate::at(x, 0.0, 0.0)
        };
        // visited out of column order
        let seq = sequence(
            4,
            GridSpecification::ExplicitCoordinates {
                points: vec![at_column(2.0, 2), at_column(0.0, 0), at_column(1.0, 1)],
            },
        );
        let drive = Arc::new(DriveParameters::resolve(&seq, 500e3, None).unwrap());
        let settings = crate::config::AcquisitionSettings {
            acquisition_time: std::time::Duration::from_micros(40),
            ..Default::default()
        };
        let plan = AcquisitionPlan::for_sequence(&settings, &drive, None);
        let points = GridGenerator::resolve(&seq.grid, Position3::default()).unwrap();
        let layout = GridGenerator::layout(&seq.grid, &points).unwrap();
        assert_eq!(layout.total(), 3);

        let mut manifest = RunManifest::new(
            store.run_dir().to_path_buf(),
            Position3::default(),
            EquipmentIds::default(),
            false,
        );
        manifest.begin_sequence(4, &seq.tag, drive.drive, points.len()).unwrap();
        store.begin_sequence(&seq, &drive, &plan, layout, points.len()).unwrap();

        let tone = |amplitude: f64, phase: f64| -> Vec<f32> {
            (0..plan.expected_samples)
                .map(|n| {
                    let t = n as f64 / plan.sample_rate_hz;
                    (amplitude * (2.0 * std::f64::consts::PI * 500e3 * t + phase).cos()) as f32
                })
                .collect()
        };
        let stored = |point: &crate::experiment::grid::TargetPoint, waveform: Option<Vec<f32>>| {
            MeasurementResult {
                sequence_id: 4,
                point: point.clone(),
                drive: Arc::clone(&drive),
                status: if waveform.is_some() { PointStatus::Success } else { PointStatus::Skipped },
                attempts: 1,
                last_error: None,
                waveform: waveform.map(|samples| Waveform {
                    samples,
                    sample_interval: std::time::Duration::from_nanos(40),
                }),
                captured_at: Some(Utc::now()),
            }
        };
        store.record(&stored(&points[0], Some(tone(0.2, 0.5))), &mut manifest).unwrap();
        store.record(&stored(&points[1], Some(tone(0.1, -0.3))), &mut manifest).unwrap();
        store.record(&stored(&points[2], None), &mut manifest).unwrap();
        store.end_sequence().unwrap();

        let map = fs::read(store.run_dir().join("sequence_4_acd.raw")).unwrap();
        assert_eq!(map.len(), 2 * 3 * 4);
        // amplitudes by column, then phases
        assert!((f32_at(&map, 0) - 0.1).abs() < 1e-3);
        assert!(f32_at(&map, 1).is_nan());
        assert!((f32_at(&map, 2) - 0.2).abs() < 1e-3);
        assert!((f32_at(&map, 3) + 0.3).abs() < 1e-3);
        assert!(f32_at(&map, 4).is_nan());
        assert!((f32_at(&map, 5) - 0.5).abs() < 1e-3);
    }
}
