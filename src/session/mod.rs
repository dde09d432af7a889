mod manager;
mod model;
pub mod store;

pub use manager::{SessionStateManager, checkpoint_file};
pub use model::{
    Checkpoint, CheckpointGap, CheckpointRef, ResumeState, Session, SessionStatus, SessionSummary,
    SessionView, UnitCounts,
};
pub use store::{FsStore, StateStore};
