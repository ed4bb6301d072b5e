mod process;
mod state;

pub use process::{
    Accountability, Actor, ChangeAction, ChangeRecord, EntityRef, NewProcess, Process, StatusRef,
    TramitHistoryEntry,
};
pub use state::{AccountabilityStatus, ProcessStatus, Role, TransitionTable};
