//! Per-workspace request handler.
//!
//! A [`WorkspaceHandler`] owns one client's view of one workspace: the initialize/shutdown/exit
//! state machine, the overlay of unsaved documents, a cache namespace, and the registry of
//! cancellable in-flight requests. Analysis itself is delegated to a [`Backend`].

mod backend;
mod handler;
mod remote;
mod state;
mod workspace;

pub use backend::{AnalysisMethod, Backend};
pub use handler::{HandlerOptions, WorkspaceHandler};
pub use remote::RemoteBackend;
pub use state::HandlerState;
