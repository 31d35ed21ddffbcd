use serde::{Deserialize, Serialize};
use std::fmt;

/// Row ids are assigned by the database; these newtypes keep campaign, user,
/// data source, column, and participant ids from being mixed up in code that
/// juggles several of them at once (table name derivation in particular).
macro_rules! row_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub fn from_i64(raw: i64) -> Self {
                Self(raw)
            }

            pub fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(UserId);
row_id!(CampaignId);
row_id!(DataSourceId);
row_id!(ColumnId);
row_id!(ParticipantId);
