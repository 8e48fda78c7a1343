pub mod command;
pub mod measurement;
pub mod modbus_point;
pub mod observed;
pub mod plant;
pub mod schedule;

pub use command::{Command, CommandQueue, CommandState};
pub use measurement::{MeasurementRow, PostItem, PostMetric};
pub use modbus_point::{ByteOrder, PointAccess, PointName, PointSpec, RegisterFormat, WordOrder};
pub use observed::{ObservedError, ObservedState, ReadStatus, TransitionState};
pub use plant::{PlantId, PlantModel, TransportMode};
pub use schedule::{build_effective_schedule, ManualSeries, ManualSeriesKey, ScheduleFrame};
