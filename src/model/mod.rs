//! Persisted entities and read-time projections.

pub mod data_product;
pub mod job;
pub mod properties;
pub mod style;
pub mod view;

pub use data_product::{DataProduct, DataProductPatch, NewDataProduct};
pub use job::{Job, JobPatch, JobPhase, JobState, JobStatus, NewJob};
pub use properties::{BandInfo, BandStats, PointCloudProperties, ProductProperties, RasterProperties};
pub use style::{StyleSettings, UserStyle};
pub use view::{data_product_view, flight_views, DataProductView};
