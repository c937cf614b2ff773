use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Kilometers per degree of arc at the equator, used for lat/lon grids
pub const KM_PER_DEG_AT_EQ: f64 = 111.198487;

/// Sentinel written into the velocity grids we generate
pub const VELOCITY_MISSING_VALUE: f64 = -999.0;

/// Horizontal projection of a grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridProjection {
    /// Flat (Cartesian) grid, spacing in kilometers
    Flat,
    /// Lat/lon grid, spacing in degrees
    LatLon,
}

impl GridProjection {
    /// Convert a grid distance to kilometers
    pub fn to_km(&self, distance: f64) -> f64 {
        match self {
            GridProjection::Flat => distance,
            GridProjection::LatLon => distance * KM_PER_DEG_AT_EQ,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            GridProjection::Flat => 0,
            GridProjection::LatLon => 1,
        }
    }

    pub fn from_code(code: u8) -> VetResult<Self> {
        match code {
            0 => Ok(GridProjection::Flat),
            1 => Ok(GridProjection::LatLon),
            other => Err(VetError::InvalidFormat(format!(
                "Unknown projection code {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for GridProjection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GridProjection::Flat => write!(f, "flat"),
            GridProjection::LatLon => write!(f, "latlon"),
        }
    }
}

/// Grid geometry: dimensions, spacing and origin of the lower-left cell center
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub nx: usize,
    pub ny: usize,
    pub dx: f64,
    pub dy: f64,
    pub min_x: f64,
    pub min_y: f64,
    pub projection: GridProjection,
}

impl GridGeometry {
    /// Create a validated grid geometry
    pub fn new(
        nx: usize,
        ny: usize,
        dx: f64,
        dy: f64,
        min_x: f64,
        min_y: f64,
        projection: GridProjection,
    ) -> VetResult<Self> {
        let geometry = Self {
            nx,
            ny,
            dx,
            dy,
            min_x,
            min_y,
            projection,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Flat grid with origin at (0, 0)
    pub fn flat(nx: usize, ny: usize, dx: f64, dy: f64) -> VetResult<Self> {
        Self::new(nx, ny, dx, dy, 0.0, 0.0, GridProjection::Flat)
    }

    pub fn validate(&self) -> VetResult<()> {
        if self.nx == 0 || self.ny == 0 {
            return Err(VetError::Shape(format!(
                "Grid dimensions must be positive, got {}x{}",
                self.nx, self.ny
            )));
        }
        if !(self.dx > 0.0) || !(self.dy > 0.0) {
            return Err(VetError::Shape(format!(
                "Grid spacing must be positive, got dx={} dy={}",
                self.dx, self.dy
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nx * self.ny
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// ndarray shape, rows are y
    pub fn shape(&self) -> (usize, usize) {
        (self.ny, self.nx)
    }

    pub fn dx_km(&self) -> f64 {
        self.projection.to_km(self.dx)
    }

    pub fn dy_km(&self) -> f64 {
        self.projection.to_km(self.dy)
    }

    /// True when two grids share projection, dimensions, spacing and origin
    pub fn same_projection(&self, other: &GridGeometry) -> bool {
        fn close(a: f64, b: f64) -> bool {
            (a - b).abs() <= 1.0e-9 * a.abs().max(b.abs()).max(1.0)
        }

        self.projection == other.projection
            && self.nx == other.nx
            && self.ny == other.ny
            && close(self.dx, other.dx)
            && close(self.dy, other.dy)
            && close(self.min_x, other.min_x)
            && close(self.min_y, other.min_y)
    }
}

impl std::fmt::Display for GridGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{} {} grid, d=({}, {}), origin=({}, {})",
            self.nx, self.ny, self.projection, self.dx, self.dy, self.min_x, self.min_y
        )
    }
}

/// A 2-D scalar grid with geo-metadata.
///
/// Data are stored row-major with x fastest: `data[[y, x]]`.
#[derive(Debug, Clone)]
pub struct ScalarField {
    pub name: String,
    pub units: String,
    pub geometry: GridGeometry,
    pub missing_value: f64,
    pub bad_value: f64,
    pub timestamp: DateTime<Utc>,
    data: Array2<f64>,
}

impl ScalarField {
    /// Wrap an array whose shape must be `(ny, nx)` of the geometry
    pub fn new(
        name: impl Into<String>,
        geometry: GridGeometry,
        data: Array2<f64>,
        missing_value: f64,
        timestamp: DateTime<Utc>,
    ) -> VetResult<Self> {
        geometry.validate()?;

        if data.dim() != geometry.shape() {
            return Err(VetError::Shape(format!(
                "Data shape {:?} does not match grid {}x{}",
                data.dim(),
                geometry.nx,
                geometry.ny
            )));
        }

        Ok(Self {
            name: name.into(),
            units: String::new(),
            geometry,
            missing_value,
            bad_value: missing_value,
            timestamp,
            data,
        })
    }

    /// Build from a flat row-major buffer of length `nx * ny`
    pub fn from_vec(
        name: impl Into<String>,
        geometry: GridGeometry,
        values: Vec<f64>,
        missing_value: f64,
        timestamp: DateTime<Utc>,
    ) -> VetResult<Self> {
        geometry.validate()?;

        if values.len() != geometry.len() {
            return Err(VetError::Shape(format!(
                "Expected {} values for a {}x{} grid, got {}",
                geometry.len(),
                geometry.nx,
                geometry.ny,
                values.len()
            )));
        }

        let data = Array2::from_shape_vec(geometry.shape(), values)
            .map_err(|e| VetError::Shape(format!("Failed to reshape field data: {}", e)))?;

        Self::new(name, geometry, data, missing_value, timestamp)
    }

    /// Field filled with one value
    pub fn constant(
        name: impl Into<String>,
        geometry: GridGeometry,
        value: f64,
        missing_value: f64,
        timestamp: DateTime<Utc>,
    ) -> VetResult<Self> {
        geometry.validate()?;
        let data = Array2::from_elem(geometry.shape(), value);
        Self::new(name, geometry, data, missing_value, timestamp)
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    pub fn with_bad_value(mut self, bad_value: f64) -> Self {
        self.bad_value = bad_value;
        self
    }

    pub fn nx(&self) -> usize {
        self.geometry.nx
    }

    pub fn ny(&self) -> usize {
        self.geometry.ny
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array2<f64> {
        &mut self.data
    }

    pub fn into_data(self) -> Array2<f64> {
        self.data
    }

    /// In-range value
    #[inline]
    pub fn value(&self, x: usize, y: usize) -> f64 {
        debug_assert!(x < self.nx() && y < self.ny(), "({}, {}) outside grid", x, y);
        self.data[[y, x]]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f64) {
        debug_assert!(x < self.nx() && y < self.ny(), "({}, {}) outside grid", x, y);
        self.data[[y, x]] = value;
    }

    /// Value at any index; out-of-range neighbors are synthesized by linear
    /// extrapolation from the edge, e.g. `2*edge - interior` one step out.
    pub fn get(&self, x: isize, y: isize) -> f64 {
        let (xe, xi, sx) = extrapolation_stencil(x, self.nx());
        let (ye, yi, sy) = extrapolation_stencil(y, self.ny());

        let along_x = |row: usize| {
            let edge = self.data[[row, xe]];
            edge + sx * (edge - self.data[[row, xi]])
        };

        let edge = along_x(ye);
        edge + sy * (edge - along_x(yi))
    }

    /// True if the value equals the missing or bad sentinel
    pub fn missing(&self, x: usize, y: usize) -> bool {
        self.is_missing_value(self.value(x, y))
    }

    #[inline]
    pub fn is_missing_value(&self, value: f64) -> bool {
        value == self.missing_value || value == self.bad_value
    }

    /// Seconds from `self` to `later`
    pub fn seconds_until(&self, later: &ScalarField) -> f64 {
        let delta = later.timestamp - self.timestamp;
        delta.num_milliseconds() as f64 / 1000.0
    }
}

/// Edge index, interior neighbor and number of steps beyond the edge
fn extrapolation_stencil(i: isize, n: usize) -> (usize, usize, f64) {
    let last = n as isize - 1;

    if i < 0 {
        let interior = if n > 1 { 1 } else { 0 };
        (0, interior, (-i) as f64)
    } else if i > last {
        let interior = if n > 1 { n - 2 } else { n - 1 };
        (n - 1, interior, (i - last) as f64)
    } else {
        (i as usize, i as usize, 0.0)
    }
}

/// Error types for echo tracking
#[derive(Debug, thiserror::Error)]
pub enum VetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid grid shape: {0}")]
    Shape(String),

    #[error("Projection mismatch: {0}")]
    ProjectionMismatch(String),

    #[error("Zero time difference between fields valid at {0}")]
    DegenerateTime(DateTime<Utc>),

    #[error("Minimization failed: {0}")]
    Minimization(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("XML parsing error: {0}")]
    XmlParsing(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for echo tracking operations
pub type VetResult<T> = Result<T, VetError>;
