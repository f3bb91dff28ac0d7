//! I/O: frame access on disk and run records.

mod image_store;
pub mod run_log;

pub use image_store::{FrameRef, ImageStore, SampleFormat, StackGeometry, TiffStore};
pub use run_log::{write_set_record, AxisValuesLog, SetRecord};
