//! Gzip-compressed grid files.
//!
//! A file holds one or more 2-D fields. After the `VETGRID1` magic and a `u16`
//! field count, every field is stored as:
//!
//! ```text
//! u32 nx, u32 ny, f64 dx, f64 dy, f64 min_x, f64 min_y, u8 projection,
//! f32 missing, f32 bad, i64 epoch seconds,
//! u16 len + name, u16 len + units,
//! nx * ny f32 values, row-major
//! ```
//!
//! All numbers are little-endian. File names carry the valid time as
//! `YYYYMMDD_HHMMSS`.

use crate::core::estimator::MotionEstimate;
use crate::core::tracker::{FieldSource, VectorSink};
use crate::params::BaseFieldInfo;
use crate::types::{GridGeometry, GridProjection, ScalarField, VetError, VetResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const GRID_FILE_MAGIC: &[u8; 8] = b"VETGRID1";
pub const GRID_FILE_EXTENSION: &str = "vgz";

/// Largest number of grid points accepted from a file header
pub const MAX_GRID_POINTS: usize = 1 << 26;
/// Values allocated ahead of the data actually read
const READ_CHUNK: usize = 1 << 16;

const TIMESTAMP_PATTERN: &str = r"(\d{8})_(\d{6})";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Encode fields into a gzip stream
pub fn encode_fields<W: Write>(writer: W, fields: &[&ScalarField]) -> VetResult<()> {
    let count = u16::try_from(fields.len())
        .map_err(|_| VetError::InvalidFormat(format!("Too many fields: {}", fields.len())))?;

    let mut encoder = GzEncoder::new(writer, Compression::default());
    encoder.write_all(GRID_FILE_MAGIC)?;
    encoder.write_u16::<LittleEndian>(count)?;

    for field in fields {
        write_field(&mut encoder, field)?;
    }

    encoder.finish()?;
    Ok(())
}

fn write_field<W: Write>(w: &mut W, field: &ScalarField) -> VetResult<()> {
    let g = &field.geometry;
    let nx = u32::try_from(g.nx).map_err(|_| VetError::Shape(format!("nx {} too large", g.nx)))?;
    let ny = u32::try_from(g.ny).map_err(|_| VetError::Shape(format!("ny {} too large", g.ny)))?;

    w.write_u32::<LittleEndian>(nx)?;
    w.write_u32::<LittleEndian>(ny)?;
    for value in [g.dx, g.dy, g.min_x, g.min_y] {
        w.write_f64::<LittleEndian>(value)?;
    }
    w.write_u8(g.projection.code())?;
    w.write_f32::<LittleEndian>(field.missing_value as f32)?;
    w.write_f32::<LittleEndian>(field.bad_value as f32)?;
    w.write_i64::<LittleEndian>(field.timestamp.timestamp())?;
    write_string(w, &field.name)?;
    write_string(w, &field.units)?;

    for value in field.data().iter() {
        w.write_f32::<LittleEndian>(*value as f32)?;
    }
    Ok(())
}

fn write_string<W: Write>(w: &mut W, text: &str) -> VetResult<()> {
    let len = u16::try_from(text.len())
        .map_err(|_| VetError::InvalidFormat(format!("String too long: {} bytes", text.len())))?;
    w.write_u16::<LittleEndian>(len)?;
    w.write_all(text.as_bytes())?;
    Ok(())
}

/// Map a short read to `InvalidFormat`, keeping other I/O errors
fn truncated(e: std::io::Error) -> VetError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => VetError::InvalidFormat("Truncated grid file".to_string()),
        _ => VetError::Io(e),
    }
}

/// Decode every field of a gzip stream
pub fn decode_fields<R: Read>(reader: R) -> VetResult<Vec<ScalarField>> {
    let mut decoder = GzDecoder::new(reader);

    let mut magic = [0u8; 8];
    decoder.read_exact(&mut magic).map_err(truncated)?;
    if &magic != GRID_FILE_MAGIC {
        return Err(VetError::InvalidFormat("Not a grid file (bad magic)".to_string()));
    }

    let count = decoder.read_u16::<LittleEndian>().map_err(truncated)?;
    (0..count).map(|_| read_field(&mut decoder)).collect()
}

fn read_string<R: Read>(r: &mut R) -> VetResult<String> {
    let len = r.read_u16::<LittleEndian>().map_err(truncated)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(truncated)?;
    String::from_utf8(buf).map_err(|e| VetError::InvalidFormat(format!("Invalid UTF-8: {}", e)))
}

fn read_field<R: Read>(r: &mut R) -> VetResult<ScalarField> {
    let nx = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let ny = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let points = nx
        .checked_mul(ny)
        .filter(|n| *n <= MAX_GRID_POINTS)
        .ok_or_else(|| {
            VetError::InvalidFormat(format!(
                "Grid of {}x{} exceeds {} points",
                nx, ny, MAX_GRID_POINTS
            ))
        })?;

    let dx = r.read_f64::<LittleEndian>().map_err(truncated)?;
    let dy = r.read_f64::<LittleEndian>().map_err(truncated)?;
    let min_x = r.read_f64::<LittleEndian>().map_err(truncated)?;
    let min_y = r.read_f64::<LittleEndian>().map_err(truncated)?;
    let projection = GridProjection::from_code(r.read_u8().map_err(truncated)?)?;
    let geometry = GridGeometry::new(nx, ny, dx, dy, min_x, min_y, projection)?;

    let missing = r.read_f32::<LittleEndian>().map_err(truncated)? as f64;
    let bad = r.read_f32::<LittleEndian>().map_err(truncated)? as f64;
    let seconds = r.read_i64::<LittleEndian>().map_err(truncated)?;
    let timestamp = Utc
        .timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| VetError::InvalidFormat(format!("Invalid timestamp {}", seconds)))?;
    let name = read_string(r)?;
    let units = read_string(r)?;

    // Grow with the data so a lying header fails on the short read
    let mut values = Vec::with_capacity(points.min(READ_CHUNK));
    let mut chunk = vec![0f32; READ_CHUNK];
    while values.len() < points {
        let n = (points - values.len()).min(READ_CHUNK);
        r.read_f32_into::<LittleEndian>(&mut chunk[..n]).map_err(truncated)?;
        values.extend(chunk[..n].iter().map(|v| *v as f64));
    }

    Ok(ScalarField::from_vec(name, geometry, values, missing, timestamp)?
        .with_bad_value(bad)
        .with_units(units))
}

/// Write fields to a grid file
pub fn write_grid_file<P: AsRef<Path>>(path: P, fields: &[&ScalarField]) -> VetResult<()> {
    log::debug!("Writing {} fields to {}", fields.len(), path.as_ref().display());
    let file = File::create(path.as_ref())?;
    encode_fields(BufWriter::new(file), fields)
}

/// Read every field of a grid file
pub fn read_grid_file<P: AsRef<Path>>(path: P) -> VetResult<Vec<ScalarField>> {
    log::debug!("Reading grid file: {}", path.as_ref().display());
    let file = File::open(path.as_ref())?;
    decode_fields(BufReader::new(file))
}

/// File name for data valid at `time`, e.g. `dbz_20240501_120000.vgz`
pub fn grid_file_name(prefix: &str, time: DateTime<Utc>) -> String {
    format!("{}_{}.{}", prefix, time.format(TIMESTAMP_FORMAT), GRID_FILE_EXTENSION)
}

fn timestamp_regex() -> VetResult<Regex> {
    Regex::new(TIMESTAMP_PATTERN)
        .map_err(|e| VetError::InvalidFormat(format!("Bad timestamp pattern: {}", e)))
}

fn parse_timestamp(regex: &Regex, file_name: &str) -> Option<DateTime<Utc>> {
    let captures = regex.captures(file_name)?;
    let text = format!("{}_{}", &captures[1], &captures[2]);
    NaiveDateTime::parse_from_str(&text, TIMESTAMP_FORMAT)
        .ok()
        .map(|t| Utc.from_utc_datetime(&t))
}

/// Valid time encoded in a file name
pub fn timestamp_from_file_name(file_name: &str) -> Option<DateTime<Utc>> {
    let regex = timestamp_regex().ok()?;
    parse_timestamp(&regex, file_name)
}

/// How the base field is picked out of a multi-field file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelector {
    Name(String),
    Index(usize),
}

impl FieldSelector {
    fn select(&self, fields: Vec<ScalarField>, path: &Path) -> VetResult<ScalarField> {
        let found = match self {
            FieldSelector::Name(name) => fields.into_iter().find(|f| &f.name == name),
            FieldSelector::Index(index) => fields.into_iter().nth(*index),
        };
        found.ok_or_else(|| {
            VetError::InvalidFormat(format!("Field {:?} not found in {}", self, path.display()))
        })
    }
}

/// Reads base fields from a directory of time-stamped grid files
pub struct GridFileSource {
    input_dir: PathBuf,
    selector: FieldSelector,
    search_margin_secs: i64,
}

impl GridFileSource {
    pub fn new<P: AsRef<Path>>(input_dir: P, selector: FieldSelector, search_margin_secs: i64) -> Self {
        Self {
            input_dir: input_dir.as_ref().to_path_buf(),
            selector,
            search_margin_secs: search_margin_secs.max(0),
        }
    }

    pub fn from_params(info: &BaseFieldInfo) -> Self {
        let selector = if info.use_field_name {
            FieldSelector::Name(info.field_name.clone())
        } else {
            FieldSelector::Index(info.field_num)
        };
        Self::new(&info.input_dir, selector, info.search_margin_secs)
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn selector(&self) -> &FieldSelector {
        &self.selector
    }

    /// Grid files in the input directory, oldest first
    pub fn list_files(&self) -> VetResult<Vec<(DateTime<Utc>, PathBuf)>> {
        let regex = timestamp_regex()?;
        let mut files = Vec::new();

        for entry in std::fs::read_dir(&self.input_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(GRID_FILE_EXTENSION) {
                continue;
            }
            let time = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| parse_timestamp(&regex, n));
            if let Some(time) = time {
                files.push((time, path));
            }
        }

        files.sort();
        log::debug!("Found {} grid files in {}", files.len(), self.input_dir.display());
        Ok(files)
    }

    /// File closest to `time` within the search margin
    pub fn closest_file(&self, time: DateTime<Utc>) -> VetResult<Option<PathBuf>> {
        let closest = self
            .list_files()?
            .into_iter()
            .map(|(t, path)| ((t - time).num_seconds().abs(), path))
            .filter(|(distance, _)| *distance <= self.search_margin_secs)
            .min_by_key(|(distance, _)| *distance);
        Ok(closest.map(|(_, path)| path))
    }
}

impl FieldSource for GridFileSource {
    fn read_base_field(&mut self, time: DateTime<Utc>) -> VetResult<Option<ScalarField>> {
        let path = match self.closest_file(time)? {
            Some(path) => path,
            None => return Ok(None),
        };

        log::info!("Reading base field for {} from {}", time, path.display());
        let fields = read_grid_file(&path)?;
        self.selector.select(fields, &path).map(Some)
    }

    fn available_times(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> VetResult<Vec<DateTime<Utc>>> {
        Ok(self
            .list_files()?
            .into_iter()
            .map(|(t, _)| t)
            .filter(|t| *t >= start && *t <= end)
            .collect())
    }

    fn latest_time(&self) -> VetResult<Option<DateTime<Utc>>> {
        Ok(self.list_files()?.pop().map(|(t, _)| t))
    }
}

/// Writes one grid file per motion estimate
pub struct GridFileSink {
    output_dir: PathBuf,
    prefix: String,
    written: Vec<PathBuf>,
}

impl GridFileSink {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            prefix: "vet".to_string(),
            written: Vec::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Paths written so far
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl VectorSink for GridFileSink {
    fn write_vector_field(&mut self, estimate: &MotionEstimate) -> VetResult<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self
            .output_dir
            .join(grid_file_name(&self.prefix, estimate.valid_time()));

        let mut fields = vec![&estimate.u, &estimate.v];
        fields.extend(estimate.grad_u.iter());
        fields.extend(estimate.grad_v.iter());

        write_grid_file(&path, &fields)?;
        log::info!("Wrote motion field to {}", path.display());
        self.written.push(path);
        Ok(())
    }
}
