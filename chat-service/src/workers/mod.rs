mod sweeper;
mod turn_recorder;

pub use sweeper::{SweepReport, Sweeper};
pub use turn_recorder::{BackgroundJob, JobQueue, PersistOutcome, TurnRecord, TurnRecorder};
