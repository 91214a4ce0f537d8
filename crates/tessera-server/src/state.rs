use std::sync::Arc;

use parking_lot::Mutex;
use tessera_jsonrpc::ResponseError;

/// Externally visible lifecycle phase of a workspace handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Uninitialized,
    Initialized,
    ShuttingDown,
}

enum Phase<W> {
    Uninitialized,
    Initialized(Arc<W>),
    ShuttingDown,
}

/// initialize/shutdown sequencing. `W` is whatever initialize produces; it is only handed out
/// while the handler is initialized.
pub(crate) struct Lifecycle<W> {
    phase: Mutex<Phase<W>>,
}

impl<W> Lifecycle<W> {
    pub(crate) fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Uninitialized),
        }
    }

    pub(crate) fn state(&self) -> HandlerState {
        match &*self.phase.lock() {
            Phase::Uninitialized => HandlerState::Uninitialized,
            Phase::Initialized(_) => HandlerState::Initialized,
            Phase::ShuttingDown => HandlerState::ShuttingDown,
        }
    }

    /// Gate for an incoming `initialize`.
    pub(crate) fn check_initialize(&self) -> Result<(), ResponseError> {
        match &*self.phase.lock() {
            Phase::Uninitialized => Ok(()),
            Phase::Initialized(_) => Err(ResponseError::invalid_request("server is already initialized")),
            Phase::ShuttingDown => Err(shutting_down()),
        }
    }

    /// Complete `initialize`. Only the first call wins.
    pub(crate) fn initialized(&self, workspace: Arc<W>) -> Result<(), ResponseError> {
        let mut phase = self.phase.lock();
        match &*phase {
            Phase::Uninitialized => {
                *phase = Phase::Initialized(workspace);
                Ok(())
            }
            Phase::Initialized(_) => Err(ResponseError::invalid_request("server is already initialized")),
            Phase::ShuttingDown => Err(shutting_down()),
        }
    }

    /// Gate for every request other than `initialize`, `shutdown` and `exit`.
    pub(crate) fn workspace(&self) -> Result<Arc<W>, ResponseError> {
        match &*self.phase.lock() {
            Phase::Initialized(workspace) => Ok(workspace.clone()),
            Phase::Uninitialized => Err(ResponseError::server_not_initialized()),
            Phase::ShuttingDown => Err(shutting_down()),
        }
    }

    /// Enter `ShuttingDown`, returning the workspace being shut down. A repeated shutdown is
    /// reported as `Ok(None)`.
    pub(crate) fn shutdown(&self) -> Result<Option<Arc<W>>, ResponseError> {
        let mut phase = self.phase.lock();
        match std::mem::replace(&mut *phase, Phase::ShuttingDown) {
            Phase::Initialized(workspace) => Ok(Some(workspace)),
            Phase::ShuttingDown => Ok(None),
            Phase::Uninitialized => {
                *phase = Phase::Uninitialized;
                Err(ResponseError::server_not_initialized())
            }
        }
    }
}

fn shutting_down() -> ResponseError {
    ResponseError::invalid_request("server is shutting down")
}

#[cfg(test)]
mod tests {
    use super::*;

    use tessera_jsonrpc::codes;

    #[test]
    fn requests_require_initialize() {
        let lifecycle: Lifecycle<()> = Lifecycle::new();
        let err = lifecycle.workspace().unwrap_err();
        assert_eq!(err.code, codes::SERVER_NOT_INITIALIZED);
        assert_eq!(err.message, "server must be initialized");

        lifecycle.initialized(Arc::new(())).unwrap();
        assert!(lifecycle.workspace().is_ok());
        assert_eq!(lifecycle.state(), HandlerState::Initialized);
    }

    #[test]
    fn initialize_only_once() {
        let lifecycle: Lifecycle<()> = Lifecycle::new();
        lifecycle.check_initialize().unwrap();
        lifecycle.initialized(Arc::new(())).unwrap();

        let err = lifecycle.check_initialize().unwrap_err();
        assert_eq!(err.code, codes::INVALID_REQUEST);
        assert_eq!(err.message, "server is already initialized");
        assert!(lifecycle.initialized(Arc::new(())).is_err());
    }

    #[test]
    fn shutdown_blocks_everything_after_it() {
        let lifecycle: Lifecycle<u8> = Lifecycle::new();
        assert!(lifecycle.shutdown().is_err());
        assert_eq!(lifecycle.state(), HandlerState::Uninitialized);

        lifecycle.initialized(Arc::new(7)).unwrap();
        assert_eq!(lifecycle.shutdown().unwrap().as_deref(), Some(&7));
        assert_eq!(lifecycle.shutdown().unwrap(), None);

        let err = lifecycle.workspace().unwrap_err();
        assert_eq!(err.message, "server is shutting down");
        assert_eq!(lifecycle.check_initialize().unwrap_err().message, "server is shutting down");
    }
}
