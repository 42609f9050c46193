pub mod command;
pub mod data;
pub mod points;

pub use command::Command;
pub use data::{DataChanged, DataPointUpdate, DataPointValue};
pub use points::{DATA_POINTS, DataPointDef, DataPointId, Encoding, PointSource};
