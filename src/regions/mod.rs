//! Zip-anchored service regions linking patients to providers.

pub mod model;
pub mod reconcile;
pub mod routes;
pub mod zip;

pub use model::{CountyCount, NewRegion, Region, RegionAssignment, ZipCount};
pub use reconcile::RegionReconciler;
pub use routes::region_routes;
