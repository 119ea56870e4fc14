//! The application state machine contract and its serial runner task.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::ApplyResponse;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::storage::SnapshotSink;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;

/// The application state machine fed by the Raft log.
///
/// The engine calls `apply` serially, in strictly increasing index order,
/// exactly once per committed command. Determinism is the application's
/// responsibility: every peer must compute the same state from the same
/// sequence of commands.
#[async_trait]
pub trait Fsm: Send + 'static {
    /// The application data type carried in command entries.
    type Data: AppData;
    /// The application's response to an applied command.
    type Response: AppDataResponse;
    /// The point-in-time snapshot handle produced by `snapshot`.
    type Snapshot: FsmSnapshot;

    /// Apply a committed command entry to the state machine.
    ///
    /// Errors returned here are treated as fatal to the node, as the state
    /// machine invariants can no longer be maintained.
    async fn apply(&mut self, entry: &Entry<Self::Data>) -> Result<Self::Response>;

    /// Capture the current state for snapshotting.
    ///
    /// This must capture a consistent point-in-time view synchronously; the
    /// returned handle's `persist` may then run concurrently with further
    /// `apply` calls.
    async fn snapshot(&mut self) -> Result<Self::Snapshot>;

    /// Replace the entire state from a snapshot produced by `persist`.
    ///
    /// The engine guarantees no `apply` call is in flight while this runs.
    async fn restore(&mut self, source: Box<dyn AsyncRead + Send + Unpin>) -> Result<()>;
}

/// A point-in-time capture of an [`Fsm`]'s state.
#[async_trait]
pub trait FsmSnapshot: Send + 'static {
    /// Write the captured state out to the given sink.
    async fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<()>;

    /// Release any resources held by the capture. Always invoked, whether or
    /// not `persist` succeeded.
    async fn release(&mut self) {}
}

/// The response channel carried alongside an entry through the apply pipeline.
pub(crate) enum ApplyResponder<R: AppDataResponse> {
    /// A client apply, resolved with the state machine's response.
    Command(oneshot::Sender<RaftResult<ApplyResponse<R>>>),
    /// A barrier or other marker, resolved with the applied index only.
    Index(oneshot::Sender<RaftResult<u64>>),
}

impl<R: AppDataResponse> ApplyResponder<R> {
    /// Resolve this responder with the given error.
    pub(crate) fn reject(self, err: RaftError) {
        match self {
            ApplyResponder::Command(tx) => {
                let _ = tx.send(Err(err));
            }
            ApplyResponder::Index(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// A message to the FSM runner task.
pub(crate) enum FsmMsg<F: Fsm> {
    /// Apply a batch of committed entries, in order.
    Apply {
        batch: Vec<(Arc<Entry<F::Data>>, Option<ApplyResponder<F::Response>>)>,
    },
    /// Capture a snapshot of the state machine.
    ///
    /// Fails with `NothingNewToSnapshot` unless a command past `min_index`
    /// has reached the state machine.
    Snapshot {
        min_index: u64,
        tx: oneshot::Sender<RaftResult<FsmCapture<F>>>,
    },
    /// Replace the state machine from a snapshot stream.
    Restore {
        log_id: LogId,
        source: Box<dyn AsyncRead + Send + Unpin>,
        tx: oneshot::Sender<RaftResult<()>>,
    },
}

/// A successful snapshot capture: the handle plus the log position it covers.
pub(crate) struct FsmCapture<F: Fsm> {
    pub log_id: LogId,
    pub snapshot: F::Snapshot,
}

/// Progress reports from the runner back to the core.
#[derive(Debug)]
pub(crate) enum FsmProgress {
    /// Entries up to the given log id have been applied.
    Applied(LogId),
    /// The state machine hit an unrecoverable error; the node must stop.
    Fatal(String),
}

/// The serial consumer which owns the user FSM.
///
/// Being the only task with access to the state machine is what yields the
/// ordering and quiescence guarantees: entries apply in the order received,
/// and a restore cannot overlap an apply.
pub(crate) struct FsmRunner<F: Fsm> {
    fsm: F,
    rx: mpsc::UnboundedReceiver<FsmMsg<F>>,
    tx_progress: mpsc::UnboundedSender<FsmProgress>,
    /// The log id of the last entry of any type processed by this runner.
    last_applied: LogId,
    /// The log id of the last command actually handed to the user FSM, which
    /// is what a snapshot can cover.
    last_fsm_log: LogId,
}

impl<F: Fsm> FsmRunner<F> {
    /// Spawn the runner, returning its command channel and progress stream.
    pub(crate) fn spawn(
        fsm: F,
        last_applied: LogId,
    ) -> (
        mpsc::UnboundedSender<FsmMsg<F>>,
        mpsc::UnboundedReceiver<FsmProgress>,
        JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (tx_progress, rx_progress) = mpsc::unbounded_channel();
        let this = Self {
            fsm,
            rx,
            tx_progress,
            last_applied,
            last_fsm_log: last_applied,
        };
        let handle = tokio::spawn(this.main().instrument(tracing::debug_span!("fsm-runner")));
        (tx, rx_progress, handle)
    }

    async fn main(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                FsmMsg::Apply { batch } => {
                    if !self.handle_apply(batch).await {
                        return;
                    }
                }
                FsmMsg::Snapshot { min_index, tx } => self.handle_snapshot(min_index, tx).await,
                FsmMsg::Restore { log_id, source, tx } => {
                    if !self.handle_restore(log_id, source, tx).await {
                        return;
                    }
                }
            }
        }
        tracing::debug!("fsm runner channel closed, stopping");
    }

    /// Apply a batch, resolving responders in apply order. Returns `false`
    /// when a fatal error stops the runner.
    async fn handle_apply(
        &mut self,
        batch: Vec<(Arc<Entry<F::Data>>, Option<ApplyResponder<F::Response>>)>,
    ) -> bool {
        for (entry, responder) in batch {
            debug_assert!(entry.log_id.index > self.last_applied.index, "apply batch out of order");
            match &entry.payload {
                EntryPayload::Command { .. } => {
                    let res = self.fsm.apply(&entry).await;
                    match res {
                        Ok(data) => {
                            self.last_fsm_log = entry.log_id;
                            if let Some(responder) = responder {
                                self.respond(responder, entry.log_id.index, data);
                            }
                        }
                        Err(err) => {
                            tracing::error!(error=%err, "fatal error applying entry to state machine");
                            if let Some(responder) = responder {
                                responder.reject(RaftError::Shutdown);
                            }
                            let _ = self.tx_progress.send(FsmProgress::Fatal(err.to_string()));
                            return false;
                        }
                    }
                }
                _ => {
                    // Noop, configuration and legacy peer entries advance the
                    // applied index without touching the user FSM.
                    if let Some(responder) = responder {
                        match responder {
                            ApplyResponder::Index(tx) => {
                                let _ = tx.send(Ok(entry.log_id.index));
                            }
                            ApplyResponder::Command(tx) => {
                                let _ = tx.send(Err(RaftError::Shutdown));
                            }
                        }
                    }
                }
            }
            self.last_applied = entry.log_id;
        }
        let _ = self.tx_progress.send(FsmProgress::Applied(self.last_applied));
        true
    }

    fn respond(&self, responder: ApplyResponder<F::Response>, index: u64, data: F::Response) {
        match responder {
            ApplyResponder::Command(tx) => {
                let _ = tx.send(Ok(ApplyResponse { index, data }));
            }
            ApplyResponder::Index(tx) => {
                let _ = tx.send(Ok(index));
            }
        }
    }

    async fn handle_snapshot(&mut self, min_index: u64, tx: oneshot::Sender<RaftResult<FsmCapture<F>>>) {
        if self.last_fsm_log.index == 0 || self.last_fsm_log.index <= min_index {
            let _ = tx.send(Err(RaftError::NothingNewToSnapshot));
            return;
        }
        match self.fsm.snapshot().await {
            Ok(snapshot) => {
                let _ = tx.send(Ok(FsmCapture {
                    log_id: self.last_fsm_log,
                    snapshot,
                }));
            }
            Err(err) => {
                tracing::error!(error=%err, "error capturing state machine snapshot");
                let _ = tx.send(Err(RaftError::Storage(err)));
            }
        }
    }

    /// Restore the FSM from a snapshot stream. Returns `false` on fatal error.
    async fn handle_restore(
        &mut self,
        log_id: LogId,
        source: Box<dyn AsyncRead + Send + Unpin>,
        tx: oneshot::Sender<RaftResult<()>>,
    ) -> bool {
        match self.fsm.restore(source).await {
            Ok(()) => {
                self.last_applied = log_id;
                self.last_fsm_log = log_id;
                let _ = self.tx_progress.send(FsmProgress::Applied(log_id));
                let _ = tx.send(Ok(()));
                true
            }
            Err(err) => {
                tracing::error!(error=%err, "fatal error restoring state machine from snapshot");
                let _ = tx.send(Err(RaftError::Storage(anyhow::anyhow!(err.to_string()))));
                let _ = self.tx_progress.send(FsmProgress::Fatal(err.to_string()));
                false
            }
        }
    }
}
