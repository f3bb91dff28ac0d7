//! Dataset discovery: acquisition layout, CT set classification and the
//! already-reconstructed index.

mod classifier;
mod layout;
mod processed;

pub use classifier::{classify, Classification, ClassifyError, CtSet, SetKind};
pub use layout::{AcquisitionLayout, DataLocation};
pub use processed::{ProcessedIndex, SLICES_DIR};
