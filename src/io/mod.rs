//! External data formats

pub mod grid_file;

pub use grid_file::{
    read_grid_file, write_grid_file, FieldSelector, GridFileSink, GridFileSource,
};
