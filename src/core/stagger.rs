//! Staggered velocity grids.
//!
//! U lives on the x-faces of the base cells: one column wider than the base
//! grid with the x origin shifted left by `dx/2`. V lives on the y-faces: one
//! row taller with the y origin shifted down by `dy/2`. Base cell `(x, y)` sits
//! between `U(x, y)` and `U(x+1, y)`, and between `V(x, y)` and `V(x, y+1)`.

use crate::types::{GridGeometry, ScalarField, VetError, VetResult, VELOCITY_MISSING_VALUE};
use chrono::{DateTime, Utc};
use ndarray::Array2;

/// Which face of the base cell a velocity component is defined on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staggering {
    U,
    V,
}

impl Staggering {
    pub fn name(&self) -> &'static str {
        match self {
            Staggering::U => "U",
            Staggering::V => "V",
        }
    }

    /// Geometry of the staggered grid for a base grid
    pub fn staggered_geometry(&self, base: &GridGeometry) -> GridGeometry {
        let mut geometry = *base;
        match self {
            Staggering::U => {
                geometry.nx += 1;
                geometry.min_x -= base.dx / 2.0;
            }
            Staggering::V => {
                geometry.ny += 1;
                geometry.min_y -= base.dy / 2.0;
            }
        }
        geometry
    }

    /// Geometry of the base grid a staggered grid belongs to
    pub fn base_geometry(&self, staggered: &GridGeometry) -> VetResult<GridGeometry> {
        let mut geometry = *staggered;
        match self {
            Staggering::U => {
                if staggered.nx < 2 {
                    return Err(VetError::Shape(format!(
                        "U grid must be at least 2 columns wide, got {}",
                        staggered.nx
                    )));
                }
                geometry.nx -= 1;
                geometry.min_x += staggered.dx / 2.0;
            }
            Staggering::V => {
                if staggered.ny < 2 {
                    return Err(VetError::Shape(format!(
                        "V grid must be at least 2 rows tall, got {}",
                        staggered.ny
                    )));
                }
                geometry.ny -= 1;
                geometry.min_y += staggered.dy / 2.0;
            }
        }
        Ok(geometry)
    }

    /// Allocate a staggered grid filled with a first-guess value
    pub fn allocate(
        &self,
        base: &GridGeometry,
        first_guess: f64,
        timestamp: DateTime<Utc>,
    ) -> VetResult<ScalarField> {
        let geometry = self.staggered_geometry(base);
        Ok(ScalarField::constant(
            self.name(),
            geometry,
            first_guess,
            VELOCITY_MISSING_VALUE,
            timestamp,
        )?
        .with_units("m/s"))
    }

    /// Average adjacent staggered values back onto the base grid
    pub fn destagger(&self, field: &ScalarField) -> VetResult<ScalarField> {
        let base = self.base_geometry(&field.geometry)?;
        let src = field.data();

        let data = match self {
            Staggering::U => Array2::from_shape_fn(base.shape(), |(y, x)| {
                (src[[y, x]] + src[[y, x + 1]]) / 2.0
            }),
            Staggering::V => Array2::from_shape_fn(base.shape(), |(y, x)| {
                (src[[y, x]] + src[[y + 1, x]]) / 2.0
            }),
        };

        Ok(ScalarField::new(
            field.name.clone(),
            base,
            data,
            field.missing_value,
            field.timestamp,
        )?
        .with_units(field.units.clone()))
    }
}

/// Number of interior (free) nodes of a grid
pub fn interior_len(field: &ScalarField) -> usize {
    field.nx().saturating_sub(2) * field.ny().saturating_sub(2)
}

/// Copy interior nodes into `out`, column-major (y fastest)
pub fn pack_interior(grid: &Array2<f64>, out: &mut [f64]) {
    let (ny, nx) = grid.dim();
    let rows = ny.saturating_sub(2);
    debug_assert_eq!(out.len(), rows * nx.saturating_sub(2));

    for x in 1..nx.saturating_sub(1) {
        for y in 1..ny.saturating_sub(1) {
            out[(y - 1) + (x - 1) * rows] = grid[[y, x]];
        }
    }
}

/// Inverse of [`pack_interior`]; the boundary ring is left untouched
pub fn unpack_interior(values: &[f64], grid: &mut Array2<f64>) {
    let (ny, nx) = grid.dim();
    let rows = ny.saturating_sub(2);
    debug_assert_eq!(values.len(), rows * nx.saturating_sub(2));

    for x in 1..nx.saturating_sub(1) {
        for y in 1..ny.saturating_sub(1) {
            grid[[y, x]] = values[(y - 1) + (x - 1) * rows];
        }
    }
}
