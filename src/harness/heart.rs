//! Structures to keep the process alive until some event occurs

use futures::{
    channel::mpsc::{channel, Receiver, Sender},
    pin_mut,
    prelude::*,
    select,
};
use std::fmt;
use tokio::signal::{
    ctrl_c,
    unix::{signal, SignalKind},
};
use tracing::{debug, error, warn};

/// Reason why the heart stopped beating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeathReason {
    /// Internal kill signal has been sent
    Killed(String),
    /// SIGINT, SIGTERM or other process-external cause
    Terminated,
}

impl fmt::Display for DeathReason {
    fn fmt(&self, w: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeathReason::Killed(reason) => write!(w, "Killed ({})", reason),
            DeathReason::Terminated => write!(w, "Terminated due to external signal"),
        }
    }
}

/// Lifecycle management struct that can be used to keep the application alive
///
/// The heart dies either when the linked [`HeartStone`] kills it or when the process
/// receives a termination signal. Modules hand it to the [`ModuleRunner`](super::ModuleRunner)
/// which then runs the regular shutdown path, the same one tests use.
pub struct Heart {
    rx: Receiver<String>,
}

impl Heart {
    /// Creates a new heart and linked stone
    pub fn new() -> (Self, HeartStone) {
        let (tx, rx) = channel(2);
        (Self { rx }, HeartStone { remote: tx })
    }

    /// Creates a new heart and discards the linked stone
    pub fn without_heart_stone() -> Self {
        Heart::new().0
    }

    /// Future that waits until the heart dies for the returned reason
    pub async fn death(&mut self) -> DeathReason {
        debug!("Heart starts beating");

        let termination = Heart::termination_signal().fuse();
        pin_mut!(termination);

        select! {
            reason = self.rx.next() => {
                match reason {
                    Some(reason) => DeathReason::Killed(reason),
                    // Every stone is gone, only a signal can stop us now
                    None => termination.await,
                }
            },
            reason = termination => reason,
        }
    }

    async fn termination_signal() -> DeathReason {
        let ctrl_c = ctrl_c().fuse();
        pin_mut!(ctrl_c);

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm_stream) => {
                let sigterm = sigterm_stream.recv().fuse();
                pin_mut!(sigterm);

                select! {
                    _ = sigterm => {},
                    _ = ctrl_c => {},
                };
            }
            Err(e) => {
                warn!(error = %e, "Unable to listen for SIGTERM, only reacting to SIGINT");
                ctrl_c.await.ok();
            }
        }

        DeathReason::Terminated
    }
}

/// Remote controller for the heart
#[derive(Clone)]
pub struct HeartStone {
    remote: Sender<String>,
}

impl HeartStone {
    /// Kill the associated heart
    pub async fn kill(&mut self, reason: String) {
        if let Err(e) = self.remote.send(reason).await {
            error!("Failed to interact with Heart: {}", e);
        }
    }
}
