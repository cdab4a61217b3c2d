use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicBool, Ordering};
use std::sync::Mutex;

use mcp_types::McpError;
use tracing::error;

use crate::transport::CloseCallback;

/// Transport lifecycle states, per the directed graph:
///
/// ```text
/// New          -> {Initializing, Stopped}
/// Initializing -> {Operational, InitializationFailed}
/// Operational  -> {ShuttingDown}
/// ShuttingDown -> {Stopped, ShutdownFailed}
/// ```
///
/// All other transitions are rejected. `InitializationFailed` and
/// `ShutdownFailed` are terminal, alongside `Stopped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    New = 0,
    Initializing = 1,
    Operational = 2,
    ShuttingDown = 3,
    Stopped = 4,
    InitializationFailed = 5,
    ShutdownFailed = 6,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::New,
            1 => State::Initializing,
            2 => State::Operational,
            3 => State::ShuttingDown,
            4 => State::Stopped,
            5 => State::InitializationFailed,
            _ => State::ShutdownFailed,
        }
    }
}

/// Shared lifecycle helper embedded (by composition, not inheritance) into
/// every transport implementation. State lives in a single atomic cell;
/// transitions use compare-and-exchange from a specified source state,
/// failing loudly on mismatch rather than silently clobbering state.
pub struct Lifecycle {
    state: AtomicU8,
    close_fired: AtomicBool,
    close_callbacks: Mutex<Vec<CloseCallback>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(State::New as u8),
            close_fired: AtomicBool::new(false),
            close_callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn register_close_callback(&self, callback: CloseCallback) {
        self.close_callbacks.lock().expect("close callback lock poisoned").push(callback);
    }

    /// Atomically moves `from -> to`. Returns `InternalError` naming both
    /// states on mismatch; callers treat that as a programming error, not a
    /// recoverable condition.
    fn transition(&self, from: State, to: State) -> Result<(), McpError> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| {
                McpError::InternalError(format!(
                    "illegal transport state transition: expected {from:?}, found {:?}, wanted {to:?}",
                    State::from_u8(actual)
                ))
            })
    }

    /// Drives `New -> Initializing`, runs the subclass's `initialize`
    /// future, then `Initializing -> Operational`. On failure, state becomes
    /// `InitializationFailed` and the error propagates.
    pub async fn start<F, Fut>(&self, initialize: F) -> Result<(), McpError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), McpError>>,
    {
        self.transition(State::New, State::Initializing)?;
        match initialize().await {
            Ok(()) => {
                self.transition(State::Initializing, State::Operational)?;
                Ok(())
            }
            Err(err) => {
                self.state.store(State::InitializationFailed as u8, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Fast-path check used by `send`: fails `ConnectionClosed` unless
    /// currently `Operational`.
    pub fn ensure_operational(&self) -> Result<(), McpError> {
        if self.current() == State::Operational {
            Ok(())
        } else {
            Err(McpError::ConnectionClosed)
        }
    }

    /// Drives the close sequence. From `Operational`, transitions through
    /// `ShuttingDown -> Stopped`, running `cleanup` in between; a cleanup
    /// failure moves state to `ShutdownFailed` and is logged, but close
    /// callbacks still fire exactly once. From `New`, transitions directly
    /// to `Stopped` with no cleanup. From any other state this is a no-op.
    pub async fn close<F, Fut>(&self, cleanup: F) -> Result<(), McpError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), McpError>>,
    {
        let should_run_cleanup = match self.current() {
            State::Operational => {
                self.transition(State::Operational, State::ShuttingDown)?;
                true
            }
            State::New => {
                // New -> Stopped directly; no cleanup, but callbacks still fire.
                let _ = self.transition(State::New, State::Stopped);
                false
            }
            _ => {
                self.fire_close_callbacks();
                return Ok(());
            }
        };

        let result = if should_run_cleanup {
            cleanup().await
        } else {
            Ok(())
        };

        if should_run_cleanup {
            match &result {
                Ok(()) => {
                    self.state.store(State::Stopped as u8, Ordering::SeqCst);
                }
                Err(err) => {
                    error!("transport cleanup failed during close: {err}");
                    self.state.store(State::ShutdownFailed as u8, Ordering::SeqCst);
                }
            }
        }

        self.fire_close_callbacks();
        result
    }

    /// Runs every registered close callback exactly once across the
    /// lifetime of this `Lifecycle`, no matter how many times `close` (or
    /// a no-op branch of it) is invoked.
    fn fire_close_callbacks(&self) {
        if self
            .close_fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let callbacks = self.close_callbacks.lock().expect("close callback lock poisoned");
            for callback in callbacks.iter() {
                callback();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn start_then_close_happy_path() {
        let lifecycle = Lifecycle::new();
        lifecycle.start(|| async { Ok(()) }).await.unwrap();
        assert_eq!(lifecycle.current(), State::Operational);
        lifecycle.close(|| async { Ok(()) }).await.unwrap();
        assert_eq!(lifecycle.current(), State::Stopped);
    }

    #[tokio::test]
    async fn failed_initialize_moves_to_initialization_failed() {
        let lifecycle = Lifecycle::new();
        let err = lifecycle
            .start(|| async { Err(McpError::InternalError("boom".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InternalError(_)));
        assert_eq!(lifecycle.current(), State::InitializationFailed);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fires_callbacks_exactly_once() {
        let lifecycle = Lifecycle::new();
        lifecycle.start(|| async { Ok(()) }).await.unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        lifecycle.register_close_callback(Arc::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        for _ in 0..5 {
            lifecycle.close(|| async { Ok(()) }).await.unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.current(), State::Stopped);
    }

    #[tokio::test]
    async fn close_from_new_skips_cleanup_but_fires_callbacks() {
        let lifecycle = Lifecycle::new();
        let ran_cleanup = Arc::new(AtomicBool::new(false));
        let ran_cleanup_clone = ran_cleanup.clone();
        lifecycle
            .close(move || {
                let flag = ran_cleanup_clone.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert!(!ran_cleanup.load(Ordering::SeqCst));
        assert_eq!(lifecycle.current(), State::Stopped);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let lifecycle = Lifecycle::new();
        let err = lifecycle.transition(State::Operational, State::Stopped).unwrap_err();
        assert!(matches!(err, McpError::InternalError(_)));
    }
}
