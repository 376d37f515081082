pub mod ctrl;
pub mod delta;
pub mod error;
pub mod ledger;
pub mod mem_ledger;
pub mod model;
pub mod satellite;
pub mod server;
pub mod subs;

pub use ctrl::Ctrl;
pub use delta::Delta;
pub use error::{Error, Result};
pub use ledger::{KeyKind, Ledger, LocalPublisher, ModelSchema, Project, Replicator};
pub use mem_ledger::MemLedger;
pub use model::{
    rev_zero, Action, Audit, Cmd, Event, Note, Rev, Sig, Status, Trans, Update, Watch,
};
pub use satellite::{Satellite, SatelliteLedger, State};
pub use subs::Subscribers;
