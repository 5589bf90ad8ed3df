//! Input/Output: results tables and serialized models

mod bundle;
mod csv;
mod results;

pub use self::csv::{read_results, write_results};
pub use bundle::{MatrixBundle, MleBundle, ModelBundle};
pub use results::{ColumnKind, ResultColumn, ResultsTable};
