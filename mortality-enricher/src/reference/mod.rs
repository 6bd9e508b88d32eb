// Reference data - slowly changing lookup tables the stream is joined against
pub mod loader;
pub mod source;
pub mod store;
pub mod table;

// Public API
pub use loader::{LoadError, LoadStats, ReferenceConfig, ReferenceLoader, TableSpec};
pub use source::{FileTableSource, TableSource};
pub use store::{load_reference_data, ReferenceRefresher, ReferenceStore};
pub use table::{JoinKey, ReferenceData, ReferenceRow, ReferenceTable};
