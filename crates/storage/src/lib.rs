pub mod catalog;
pub mod connections;
pub mod data_table;
pub mod error;
pub mod hourly;
pub mod schema;

pub use catalog::Catalog;
pub use connections::{Connections, SchemaConn, CORE_SCHEMA, DATA_SCHEMA};
pub use data_table::{AggDataTable, DataTable, PhysicalTable};
pub use error::StorageError;
pub use hourly::{Amount, Histogram, HourlyStatsStore, AMOUNT_KEY};
