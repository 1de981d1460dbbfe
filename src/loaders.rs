//! Ingestion executors
//!
//! Measures CSV, OBJ vertex lists, raster images and YAML settings. Each
//! parser runs inside a scheduled task and never touches workspace state;
//! results are applied by the task's continuation.

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use csv::{ReaderBuilder, StringRecord};
use thiserror::Error;
use tracing::debug;

use crate::config::Settings;
use crate::geometry::Geometry;
use crate::scheduler::{Executor, ExecutorPort, TaskType};
use crate::spots::{Extent, Measure, Spot};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFailure {
    TooFewElements,
    InvalidCoordinates,
    Parsing,
}

impl std::fmt::Display for RowFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RowFailure::TooFewElements => "Too few elements",
            RowFailure::InvalidCoordinates => "Invalid spot coordinates",
            RowFailure::Parsing => "Parsing error",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("Failure in row {row}: {failure}")]
    Row { row: u64, failure: RowFailure },
    #[error("Failure in line {line}: {message}")]
    Line { line: usize, message: String },
    #[error("File is not valid UTF-8")]
    Encoding,
    #[error("Unsupported image: {0}")]
    Image(String),
}

/// Fixed leading columns of a measures CSV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpotLayout {
    /// name,x,y,z,r
    #[default]
    Sphere,
    /// name,x,y,z,sx,sy,sz
    Cuboid,
}

impl SpotLayout {
    fn fixed_columns(self) -> usize {
        match self {
            SpotLayout::Sphere => 5,
            SpotLayout::Cuboid => 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasuresData {
    pub spots: Vec<Spot>,
    pub measures: Vec<Measure>,
}

pub struct MeasuresLoader {
    layout: SpotLayout,
}

impl MeasuresLoader {
    pub fn new(layout: SpotLayout) -> Self {
        Self { layout }
    }

    /// Parses a measures CSV. `on_row` runs after every data row with the row
    /// number and may abort the parse.
    pub fn parse<R, F>(&self, reader: R, mut on_row: F) -> anyhow::Result<MeasuresData>
    where
        R: Read,
        F: FnMut(u64) -> anyhow::Result<()>,
    {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let fixed = self.layout.fixed_columns();
        let headers = reader
            .headers()
            .map_err(|_| LoadError::Row {
                row: 0,
                failure: RowFailure::Parsing,
            })?
            .clone();
        let mut measures: Vec<Measure> = headers
            .iter()
            .skip(fixed)
            .map(|name| Measure {
                name: name.to_string(),
                values: Vec::new(),
            })
            .collect();

        let mut spots = Vec::new();
        let mut record = StringRecord::new();
        let mut row = 0;
        loop {
            match reader.read_record(&mut record) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    let row = e.position().map_or(row + 1, |p| p.line().saturating_sub(1));
                    return Err(LoadError::Row {
                        row,
                        failure: RowFailure::Parsing,
                    }
                    .into());
                }
            }
            // Header is row 0, blank lines still count
            row = record
                .position()
                .map_or(row + 1, |p| p.line().saturating_sub(1));

            if record.len() == 1 && record[0].trim().is_empty() {
                continue;
            }
            if record.len() < fixed + measures.len() {
                return Err(LoadError::Row {
                    row,
                    failure: RowFailure::TooFewElements,
                }
                .into());
            }

            let spot = self.parse_spot(&record).ok_or(LoadError::Row {
                row,
                failure: RowFailure::InvalidCoordinates,
            })?;
            for (j, measure) in measures.iter_mut().enumerate() {
                measure.values.push(parse_value(&record[fixed + j]));
            }
            spots.push(spot);

            on_row(row)?;
        }

        debug!(
            "Parsed {} spots with {} measures",
            spots.len(),
            measures.len()
        );
        Ok(MeasuresData { spots, measures })
    }

    fn parse_spot(&self, record: &StringRecord) -> Option<Spot> {
        let x = parse_number(&record[1])?;
        let y = parse_number(&record[2])?;
        let z = match record[3].trim() {
            "" => 0.0,
            z => parse_number(z)?,
        };
        let extent = match self.layout {
            SpotLayout::Sphere => Extent::Radius(parse_number(&record[4])?),
            SpotLayout::Cuboid => Extent::Cuboid([
                parse_number(&record[4])?,
                parse_number(&record[5])?,
                parse_number(&record[6])?,
            ]),
        };
        Some(Spot::new(record[0].to_string(), [x, y, z], extent))
    }
}

fn parse_number(cell: &str) -> Option<f32> {
    cell.trim().parse::<f32>().ok().filter(|v| v.is_finite())
}

/// Missing or non-numeric cells are NaN
fn parse_value(cell: &str) -> f32 {
    cell.trim().parse::<f32>().unwrap_or(f32::NAN)
}

/// Reads `v x y z` lines of a Wavefront OBJ file, everything else is ignored
pub fn parse_obj_vertices(text: &str) -> Result<Vec<[f32; 3]>, LoadError> {
    let mut positions = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("v") {
            continue;
        }
        let coords: Vec<f32> = tokens
            .take(3)
            .map(|t| t.parse::<f32>())
            .collect::<Result<_, _>>()
            .map_err(|_| LoadError::Line {
                line: index + 1,
                message: "Invalid vertex".to_string(),
            })?;
        let [x, y, z] = coords[..] else {
            return Err(LoadError::Line {
                line: index + 1,
                message: "Vertex needs 3 coordinates".to_string(),
            });
        };
        positions.push([x, y, z]);
    }
    Ok(positions)
}

/// Decodes a raster image into an image geometry with per-pixel base colors
pub fn decode_image(bytes: &[u8]) -> Result<Geometry, LoadError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| LoadError::Image(e.to_string()))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    let colors = image
        .pixels()
        .map(|p| p.0.map(|c| f32::from(c) / 255.0))
        .collect();
    Ok(Geometry::image(width, height, Some(colors)))
}

/// Payload for [`LOAD_MEASURES`]
#[derive(Debug, Clone)]
pub struct MeasuresSource {
    pub data: Arc<[u8]>,
    pub layout: SpotLayout,
}

pub struct MeasuresExecutor;

impl Executor for MeasuresExecutor {
    type Payload = MeasuresSource;
    type Output = MeasuresData;

    fn execute(
        &mut self,
        source: MeasuresSource,
        port: &ExecutorPort<MeasuresData>,
    ) -> anyhow::Result<MeasuresData> {
        let mut last_report = Instant::now();
        MeasuresLoader::new(source.layout).parse(&source.data[..], |row| {
            port.check_cancelled()?;
            if last_report.elapsed() >= PROGRESS_INTERVAL {
                last_report = Instant::now();
                port.progress(format!("Loading measures: {} rows processed", row));
            }
            Ok(())
        })
    }
}

pub struct MeshExecutor;

impl Executor for MeshExecutor {
    type Payload = Arc<[u8]>;
    type Output = Geometry;

    fn execute(&mut self, data: Arc<[u8]>, port: &ExecutorPort<Geometry>) -> anyhow::Result<Geometry> {
        port.progress("Loading mesh");
        let text = std::str::from_utf8(&data).map_err(|_| LoadError::Encoding)?;
        let positions = parse_obj_vertices(text)?;
        debug!("Loaded mesh with {} vertices", positions.len());
        Ok(Geometry::surface(positions))
    }
}

pub struct ImageExecutor;

impl Executor for ImageExecutor {
    type Payload = Arc<[u8]>;
    type Output = Geometry;

    fn execute(&mut self, data: Arc<[u8]>, port: &ExecutorPort<Geometry>) -> anyhow::Result<Geometry> {
        port.progress("Decoding image");
        Ok(decode_image(&data)?)
    }
}

pub struct SettingsExecutor;

impl Executor for SettingsExecutor {
    type Payload = Arc<str>;
    type Output = Settings;

    fn execute(&mut self, text: Arc<str>, _port: &ExecutorPort<Settings>) -> anyhow::Result<Settings> {
        Settings::from_yaml(&text)
    }
}

pub const LOAD_MEASURES: TaskType<MeasuresExecutor> = TaskType {
    key: "load-measures",
    factory: || MeasuresExecutor,
};

pub const LOAD_MESH: TaskType<MeshExecutor> = TaskType {
    key: "load-mesh",
    factory: || MeshExecutor,
};

pub const LOAD_IMAGE: TaskType<ImageExecutor> = TaskType {
    key: "load-image",
    factory: || ImageExecutor,
};

pub const LOAD_SETTINGS: TaskType<SettingsExecutor> = TaskType {
    key: "load-settings",
    factory: || SettingsExecutor,
};
