pub mod error;
pub mod settings;
pub mod statistics;
pub mod task;
mod time;

pub use error::{CoreError, CoreErrorKind};
pub use settings::{AiSettings, ConfigurationGate, FeatureGates, SettingsError, SettingsHandle};
pub use statistics::TaskStatistics;
pub use task::{Task, TaskId, TaskParameters, TaskStatus, TaskType};
