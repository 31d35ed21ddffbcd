pub mod column_type;
pub mod error;
pub mod ids;
pub mod model;
pub mod time;
pub mod value;

pub use column_type::ColumnType;
pub use error::CoreError;
pub use ids::*;
pub use model::{
    Campaign, Column, DataRecord, DataSource, Participant, Supervisor, User, TIMESTAMP_COLUMN,
};
pub use time::{floor_hour, to_naive_utc};
pub use value::CellValue;
