// core data model
pub mod error;
pub mod sampling;
pub mod neighbors;
pub mod geometry;
pub mod cell_info;
pub mod tag;
pub mod cluster;
