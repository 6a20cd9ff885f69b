//! Panel loader: the wait pipeline in front of a search.
//!
//! `Idle → Debouncing → WaitingVisible → WaitingVariables → Loading → Done | Cancelled | Error`.
//! Every wait observes the same cancellation token, so unmounting a panel at any stage
//! unwinds the whole pipeline.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use sluice_core::{SluiceError, SluiceResult};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoaderState {
    Idle,
    Debouncing,
    WaitingVisible,
    WaitingVariables,
    Loading,
    Done,
    Cancelled,
    Error,
}

impl LoaderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoaderState::Done | LoaderState::Cancelled | LoaderState::Error)
    }
}

enum Wait {
    Ready,
    Cancelled,
    Closed,
}

async fn wait_true(rx: &mut watch::Receiver<bool>, token: &CancellationToken) -> Wait {
    tokio::select! {
        biased;
        _ = token.cancelled() => Wait::Cancelled,
        r = rx.wait_for(|v| *v) => match r {
            Ok(_) => Wait::Ready,
            Err(_) => Wait::Closed,
        },
    }
}

pub struct PanelLoader {
    state_tx: watch::Sender<LoaderState>,
    visible: watch::Receiver<bool>,
    variables_ready: watch::Receiver<bool>,
    debounce: Duration,
    token: CancellationToken,
}

impl PanelLoader {
    pub fn new(debounce: Duration, visible: watch::Receiver<bool>, variables_ready: watch::Receiver<bool>) -> Self {
        let (state_tx, _) = watch::channel(LoaderState::Idle);
        Self { state_tx, visible, variables_ready, debounce, token: CancellationToken::new() }
    }

    pub fn state(&self) -> LoaderState { *self.state_tx.borrow() }

    pub fn subscribe(&self) -> watch::Receiver<LoaderState> { self.state_tx.subscribe() }

    pub fn cancel_token(&self) -> CancellationToken { self.token.clone() }

    /// Unmount: cancels whatever stage the pipeline is in.
    pub fn cancel(&self) { self.token.cancel(); }

    fn set(&self, next: LoaderState) {
        debug!(state = ?next, "loader: transition");
        self.state_tx.send_replace(next);
    }

    fn finish(&self, next: LoaderState) -> LoaderState {
        info!(state = ?next, "loader: finished");
        self.set(next);
        next
    }

    /// Walk the pipeline and run `search` once the panel is visible and its variables
    /// resolved. The search receives the shared token.
    pub async fn load<F, Fut>(&mut self, search: F) -> SluiceResult<LoaderState>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = SluiceResult<()>>,
    {
        if self.token.is_cancelled() {
            return Ok(self.finish(LoaderState::Cancelled));
        }
        let token = self.token.clone();

        self.set(LoaderState::Debouncing);
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(self.finish(LoaderState::Cancelled)),
            _ = tokio::time::sleep(self.debounce) => {}
        }

        self.set(LoaderState::WaitingVisible);
        match wait_true(&mut self.visible, &token).await {
            Wait::Ready => {}
            Wait::Cancelled => return Ok(self.finish(LoaderState::Cancelled)),
            Wait::Closed => {
                self.finish(LoaderState::Error);
                return Err(SluiceError::Internal("visibility source closed".into()));
            }
        }

        self.set(LoaderState::WaitingVariables);
        match wait_true(&mut self.variables_ready, &token).await {
            Wait::Ready => {}
            Wait::Cancelled => return Ok(self.finish(LoaderState::Cancelled)),
            Wait::Closed => {
                self.finish(LoaderState::Error);
                return Err(SluiceError::Internal("variables source closed".into()));
            }
        }

        self.set(LoaderState::Loading);
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SluiceError::Cancelled),
            r = search(token.clone()) => r,
        };
        match outcome {
            Ok(()) => Ok(self.finish(LoaderState::Done)),
            Err(SluiceError::Cancelled) => Ok(self.finish(LoaderState::Cancelled)),
            Err(e) => {
                self.finish(LoaderState::Error);
                Err(e)
            }
        }
    }
}
