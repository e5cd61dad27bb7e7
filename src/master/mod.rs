//! Master role: event translation, snapshotting, and the slave-facing
//! transport

pub mod server;
pub mod session;
pub mod snapshot;
pub mod translator;

pub use server::MasterServer;
pub use session::{ClientInfo, SlaveStatus};
pub use translator::{EventTranslator, SyncTargets};
