//! Spatial grid resolution.
//!
//! A sequence describes where to measure either as an explicit list of offsets
//! or as per-axis bounds, step sizes and an assignment of the three stage axes
//! to slices, rows and columns. [`GridGenerator::resolve`] turns either form
//! into the ordered list of [`TargetPoint`]s that the sequencer visits.
//!
//! # Ordering
//!
//! Bounds-based grids are visited slice by slice, row by row, column by column
//! (lexicographic in `(slice, row, column)`). Result files are indexed by this
//! order, so it must not change. [`ScanPattern::Serpentine`] is an opt-in that
//! reverses the column direction on alternate rows to shorten stage travel.
//!
//! # Direction mapping
//!
//! Each of slices, rows and columns is assigned a signed axis such as `"+x"` or
//! `"-z"`. A `+` axis is traversed from `-max_minus` up to `+max_plus`; a `-`
//! axis from `+max_plus` down to `-max_minus`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CharacError, CharacResult};
use crate::hardware::Position3;

/// Upper bound on the number of points a single grid may resolve to.
pub const MAX_GRID_POINTS: usize = 10_000_000;

/// Tolerance applied before rounding a point count up.
const COUNT_EPSILON: f64 = 1e-9;

/// Stage axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// X axis
    X,
    /// Y axis
    Y,
    /// Z axis
    Z,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        };
        write!(f, "{}", label)
    }
}

/// A stage axis and the direction it is traversed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AxisDirection {
    /// Axis being traversed.
    pub axis: Axis,
    /// Traverse from `+max_plus` towards `-max_minus`.
    pub descending: bool,
}

impl AxisDirection {
    /// Ascending traversal of `axis`.
    pub const fn ascending(axis: Axis) -> Self {
        Self {
            axis,
            descending: false,
        }
    }

    /// Descending traversal of `axis`.
    pub const fn descending(axis: Axis) -> Self {
        Self {
            axis,
            descending: true,
        }
    }
}

impl FromStr for AxisDirection {
    type Err = CharacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().to_ascii_lowercase();
        let (descending, name) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(&trimmed)),
        };
        let axis = match name.trim() {
            "x" => Axis::X,
            "y" => Axis::Y,
            "z" => Axis::Z,
            _ => {
                return Err(CharacError::InvalidGridSpec(format!(
                    "'{}' is not an axis direction (expected e.g. +x, -y, z)",
                    s
                )))
            }
        };
        Ok(Self { axis, descending })
    }
}

impl TryFrom<String> for AxisDirection {
    type Error = CharacError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AxisDirection> for String {
    fn from(value: AxisDirection) -> Self {
        value.to_string()
    }
}

impl fmt::Display for AxisDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.descending { '-' } else { '+' };
        write!(f, "{}{}", sign, self.axis)
    }
}

/// Assignment of stage axes to slices (outer), rows and columns (inner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisMapping {
    /// Outermost loop.
    pub slices: AxisDirection,
    /// Middle loop.
    pub rows: AxisDirection,
    /// Innermost loop.
    pub columns: AxisDirection,
}

impl Default for AxisMapping {
    /// Slices along +z, rows along +y, columns along +x.
    fn default() -> Self {
        Self {
            slices: AxisDirection::ascending(Axis::Z),
            rows: AxisDirection::ascending(Axis::Y),
            columns: AxisDirection::ascending(Axis::X),
        }
    }
}

impl AxisMapping {
    /// Reject mappings that are not a permutation of {x, y, z}.
    pub fn validate(&self) -> CharacResult<()> {
        let axes = [self.slices.axis, self.rows.axis, self.columns.axis];
        if axes[0] == axes[1] || axes[0] == axes[2] || axes[1] == axes[2] {
            return Err(CharacError::InvalidGridSpec(format!(
                "direction mapping slices={}, rows={}, columns={} is not a permutation of x, y, z",
                self.slices, self.rows, self.columns
            )));
        }
        Ok(())
    }
}

/// Extent of one axis around the zero point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisExtent {
    /// Maximum excursion in the + direction [mm].
    pub max_plus: f64,
    /// Maximum excursion in the - direction [mm], as a positive number.
    pub max_minus: f64,
}

impl AxisExtent {
    /// Same excursion either side of zero.
    pub const fn symmetric(max: f64) -> Self {
        Self {
            max_plus: max,
            max_minus: max,
        }
    }

    fn span(&self) -> f64 {
        self.max_plus + self.max_minus
    }
}

/// Per-axis extents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// X extent
    pub x: AxisExtent,
    /// Y extent
    pub y: AxisExtent,
    /// Z extent
    pub z: AxisExtent,
}

impl Bounds {
    fn extent(&self, axis: Axis) -> AxisExtent {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }
}

/// Order in which columns are visited within a row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPattern {
    /// Every row in the same column direction.
    #[default]
    Raster,
    /// Column direction alternates between consecutive rows.
    Serpentine,
}

/// Bounds-based grid description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundsAndSteps {
    /// Extents around the zero point.
    pub bounds: Bounds,
    /// Step size per axis [mm].
    pub steps: Position3,
    /// Axis-to-loop assignment.
    #[serde(default)]
    pub mapping: AxisMapping,
    /// Column visiting order.
    #[serde(default)]
    pub pattern: ScanPattern,
}

/// One row of a coordinate file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplicitCoordinate {
    /// Offset from the zero point [mm].
    pub offset: Position3,
    /// Measurement number from the file.
    #[serde(default)]
    pub measurement_number: Option<u32>,
    /// Cluster number from the file.
    #[serde(default)]
    pub cluster_number: Option<u32>,
    /// Indices number from the file.
    #[serde(default)]
    pub indices_number: Option<u32>,
    /// Slice number from the file.
    #[serde(default)]
    pub slice: Option<u32>,
    /// Row number from the file.
    #[serde(default)]
    pub row: Option<u32>,
    /// Column number from the file.
    #[serde(default)]
    pub column: Option<u32>,
}

impl ExplicitCoordinate {
    /// Bare offset with no file metadata.
    pub fn at(x: f64, y: f64, z: f64) -> Self {
        Self {
            offset: Position3::new(x, y, z),
            ..Default::default()
        }
    }
}

/// Where a sequence measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GridSpecification {
    /// Offsets visited in file order.
    ExplicitCoordinates {
        /// Coordinate rows.
        points: Vec<ExplicitCoordinate>,
    },
    /// Regular grid.
    BoundsAndSteps(BoundsAndSteps),
}

impl GridSpecification {
    /// Spacing between neighbouring columns [mm]. Explicit coordinates have none.
    pub fn column_step_mm(&self) -> Option<f64> {
        match self {
            GridSpecification::ExplicitCoordinates { .. } => None,
            GridSpecification::BoundsAndSteps(grid) => Some(grid.steps.axis(grid.mapping.columns.axis)),
        }
    }
}

/// Position of a point within its grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridIndex {
    /// Slice index.
    pub slice: usize,
    /// Row index.
    pub row: usize,
    /// Column index.
    pub column: usize,
    /// Visit order within the sequence, from 0.
    pub flat: usize,
}

impl fmt::Display for GridIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} [s{} r{} c{}]",
            self.flat, self.slice, self.row, self.column
        )
    }
}

/// A resolved measurement location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetPoint {
    /// Grid position and visit order.
    pub index: GridIndex,
    /// Offset from the zero point [mm].
    pub offset: Position3,
    /// Absolute stage position [mm].
    pub absolute: Position3,
    /// Exhausting retries here aborts the run.
    #[serde(default)]
    pub critical: bool,
    /// Measurement number (1-based unless supplied by a coordinate file).
    pub measurement_number: u32,
    /// Cluster number from a coordinate file.
    #[serde(default)]
    pub cluster_number: Option<u32>,
    /// Indices number from a coordinate file.
    #[serde(default)]
    pub indices_number: Option<u32>,
}

/// Number of slices, rows and columns spanned by a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridDimensions {
    /// Slice count
    pub slices: usize,
    /// Row count
    pub rows: usize,
    /// Column count
    pub columns: usize,
}

impl GridDimensions {
    /// Total number of points.
    pub fn total(&self) -> usize {
        self.slices * self.rows * self.columns
    }

    /// Position of `index` in slice-major, then row, then column order.
    pub fn slot(&self, index: &GridIndex) -> Option<usize> {
        if index.slice >= self.slices || index.row >= self.rows || index.column >= self.columns {
            return None;
        }
        Some((index.slice * self.rows + index.row) * self.columns + index.column)
    }
}

/// Resolves grid specifications into ordered target points.
pub struct GridGenerator;

impl GridGenerator {
    /// Resolve `spec` relative to `zero`.
    ///
    /// Deterministic: identical inputs always yield an identical list.
    pub fn resolve(spec: &GridSpecification, zero: Position3) -> CharacResult<Vec<TargetPoint>> {
        if !zero.is_finite() {
            return Err(CharacError::InvalidGridSpec(format!(
                "zero point {:?} is not finite",
                zero
            )));
        }
        match spec {
            GridSpecification::ExplicitCoordinates { points } => Self::resolve_explicit(points, zero),
            GridSpecification::BoundsAndSteps(grid) => Self::resolve_bounds(grid, zero),
        }
    }

    /// Dimensions of a bounds-based grid, validating it on the way.
    pub fn dimensions(grid: &BoundsAndSteps) -> CharacResult<GridDimensions> {
        grid.mapping.validate()?;
        let slices = axis_count(grid, grid.mapping.slices.axis)?;
        let rows = axis_count(grid, grid.mapping.rows.axis)?;
        let columns = axis_count(grid, grid.mapping.columns.axis)?;
        let dims = GridDimensions {
            slices,
            rows,
            columns,
        };
        let total = slices
            .checked_mul(rows)
            .and_then(|n| n.checked_mul(columns))
            .unwrap_or(usize::MAX);
        if total == 0 || total > MAX_GRID_POINTS {
            return Err(CharacError::InvalidGridSpec(format!(
                "grid resolves to {} × {} × {} points (allowed 1..={})",
                slices, rows, columns, MAX_GRID_POINTS
            )));
        }
        Ok(dims)
    }

    /// Slice/row/column extent that holds every point of `points`.
    ///
    /// Bounds grids use their own dimensions. Explicit coordinates span the
    /// largest index on each axis; rows without index columns line up along
    /// a single row in file order.
    pub fn layout(spec: &GridSpecification, points: &[TargetPoint]) -> CharacResult<GridDimensions> {
        match spec {
            GridSpecification::BoundsAndSteps(grid) => Self::dimensions(grid),
            GridSpecification::ExplicitCoordinates { .. } => {
                let extent = |pick: fn(&GridIndex) -> usize| {
                    points.iter().map(|p| pick(&p.index) + 1).max().unwrap_or(0)
                };
                let dims = GridDimensions {
                    slices: extent(|i| i.slice),
                    rows: extent(|i| i.row),
                    columns: extent(|i| i.column),
                };
                let total = dims
                    .slices
                    .checked_mul(dims.rows)
                    .and_then(|n| n.checked_mul(dims.columns))
                    .unwrap_or(usize::MAX);
                if total == 0 || total > MAX_GRID_POINTS {
                    return Err(CharacError::InvalidGridSpec(format!(
                        "coordinate indices span {} × {} × {} slots (allowed 1..={})",
                        dims.slices, dims.rows, dims.columns, MAX_GRID_POINTS
                    )));
                }
                Ok(dims)
            }
        }
    }

    fn resolve_explicit(
        rows: &[ExplicitCoordinate],
        zero: Position3,
    ) -> CharacResult<Vec<TargetPoint>> {
        if rows.is_empty() {
            return Err(CharacError::InvalidGridSpec(
                "coordinate list is empty".to_string(),
            ));
        }
        rows.iter()
            .enumerate()
            .map(|(flat, row)| {
                if !row.offset.is_finite() {
                    return Err(CharacError::InvalidGridSpec(format!(
                        "coordinate row {} is not finite: {:?}",
                        flat + 1,
                        row.offset
                    )));
                }
                let offset = round_offset(row.offset);
                Ok(TargetPoint {
                    index: GridIndex {
                        slice: row.slice.map_or(0, |v| v as usize),
                        row: row.row.map_or(0, |v| v as usize),
                        column: row.column.map_or(flat, |v| v as usize),
                        flat,
                    },
                    offset,
                    absolute: zero + offset,
                    critical: false,
                    measurement_number: row.measurement_number.unwrap_or(flat as u32 + 1),
                    cluster_number: row.cluster_number,
                    indices_number: row.indices_number,
                })
            })
            .collect()
    }

    fn resolve_bounds(grid: &BoundsAndSteps, zero: Position3) -> CharacResult<Vec<TargetPoint>> {
        let dims = Self::dimensions(grid)?;
        let mapping = grid.mapping;
        let mut points = Vec::with_capacity(dims.total());

        for slice in 0..dims.slices {
            for row in 0..dims.rows {
                let reverse = grid.pattern == ScanPattern::Serpentine
                    && (slice * dims.rows + row) % 2 == 1;
                for step in 0..dims.columns {
                    let column = if reverse { dims.columns - 1 - step } else { step };

                    let mut offset = Position3::default();
                    *offset.axis_mut(mapping.slices.axis) = axis_offset(grid, mapping.slices, slice);
                    *offset.axis_mut(mapping.rows.axis) = axis_offset(grid, mapping.rows, row);
                    *offset.axis_mut(mapping.columns.axis) = axis_offset(grid, mapping.columns, column);
                    let offset = round_offset(offset);

                    let flat = points.len();
                    points.push(TargetPoint {
                        index: GridIndex {
                            slice,
                            row,
                            column,
                            flat,
                        },
                        offset,
                        absolute: zero + offset,
                        critical: false,
                        measurement_number: flat as u32 + 1,
                        cluster_number: None,
                        indices_number: None,
                    });
                }
            }
        }
        Ok(points)
    }
}

fn axis_count(grid: &BoundsAndSteps, axis: Axis) -> CharacResult<usize> {
    let extent = grid.bounds.extent(axis);
    let step = grid.steps.axis(axis);
    if !(step.is_finite() && step > 0.0) {
        return Err(CharacError::InvalidGridSpec(format!(
            "step size along {} must be positive, got {}",
            axis, step
        )));
    }
    if !(extent.max_plus.is_finite() && extent.max_minus.is_finite())
        || extent.max_plus < 0.0
        || extent.max_minus < 0.0
    {
        return Err(CharacError::InvalidGridSpec(format!(
            "extent along {} must be non-negative, got +{} / -{}",
            axis, extent.max_plus, extent.max_minus
        )));
    }
    let count = (extent.span() / step + 1.0 - COUNT_EPSILON).ceil();
    if count > MAX_GRID_POINTS as f64 {
        return Err(CharacError::InvalidGridSpec(format!(
            "{} points along {} exceeds the limit of {}",
            count, axis, MAX_GRID_POINTS
        )));
    }
    Ok(count as usize)
}

fn axis_offset(grid: &BoundsAndSteps, direction: AxisDirection, index: usize) -> f64 {
    let extent = grid.bounds.extent(direction.axis);
    let step = grid.steps.axis(direction.axis);
    if direction.descending {
        extent.max_plus - index as f64 * step
    } else {
        -extent.max_minus + index as f64 * step
    }
}

/// Snap to the micrometre so repeated steps do not accumulate float noise.
fn round_offset(p: Position3) -> Position3 {
    let r = |v: f64| {
        let snapped = (v * 1000.0).round() / 1000.0;
        if snapped == 0.0 {
            0.0
        } else {
            snapped
        }
    };
    Position3::new(r(p.x), r(p.y), r(p.z))
}
