// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Admits or rejects requests to change a domain's state.
//!
//! A launcher runs at most one lifecycle operation at a time. The queue
//! therefore holds at most one request: while a request is queued or being
//! handled by the state driver, every other request is denied as busy rather
//! than waiting behind it.
//!
//! When the queue is idle, each kind of request has a disposition derived
//! from the domain's most recently confirmed state. A request may be
//! enqueued, denied, or silently ignored when the domain is already where
//! the request would put it (pausing a paused domain, for example).
//!
//! Users who want to share a queue must wrap it in the synchronization
//! objects of their choice.

use std::time::Duration;

use domain_api_types::{
    DomainState, MigrationPolicy, MigrationTarget, PlacementConstraints,
    VmSpec,
};
use serde_derive::{Deserialize, Serialize};
use slog::{debug, info, Logger};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::migrate::MigrationOutcome;

use super::{ReconcileOutcome, ShutdownOutcome, VmError};

pub(super) type Reply<T> = oneshot::Sender<Result<T, VmError>>;

/// A request to change the domain's state. Handled by the state driver,
/// which sends the result on the request's reply channel.
pub enum ExternalRequest {
    /// Makes the domain match `spec`, defining and starting it if needed.
    Reconcile {
        spec: Box<VmSpec>,
        placement: PlacementConstraints,
        reply: Reply<ReconcileOutcome>,
    },

    Pause {
        reply: Reply<()>,
    },

    Resume {
        reply: Reply<()>,
    },

    /// Stops the domain. A graceful shutdown that has not finished by
    /// `deadline` is escalated to a forced stop.
    Shutdown {
        graceful: bool,
        deadline: Duration,
        reply: Reply<ShutdownOutcome>,
    },

    /// Migrates the domain to another host. Cancelling `cancel` asks the
    /// daemon to abort the migration.
    Migrate {
        target: MigrationTarget,
        policy: MigrationPolicy,
        cancel: CancellationToken,
        reply: Reply<MigrationOutcome>,
    },

    /// Undefines a domain that is not running.
    Teardown {
        reply: Reply<()>,
    },
}

impl ExternalRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Reconcile { .. } => RequestKind::Reconcile,
            Self::Pause { .. } => RequestKind::Pause,
            Self::Resume { .. } => RequestKind::Resume,
            Self::Shutdown { .. } => RequestKind::Shutdown,
            Self::Migrate { .. } => RequestKind::Migrate,
            Self::Teardown { .. } => RequestKind::Teardown,
        }
    }
}

impl std::fmt::Debug for ExternalRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reconcile { spec, .. } => f
                .debug_struct("Reconcile")
                .field("name", &spec.name)
                .finish_non_exhaustive(),
            Self::Shutdown { graceful, deadline, .. } => f
                .debug_struct("Shutdown")
                .field("graceful", graceful)
                .field("deadline", deadline)
                .finish_non_exhaustive(),
            Self::Migrate { target, .. } => f
                .debug_struct("Migrate")
                .field("target", &target.uri)
                .finish_non_exhaustive(),
            other => write!(f, "{}", other.kind()),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Reconcile,
    Pause,
    Resume,
    Shutdown,
    Migrate,
    Teardown,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Reconcile => "reconcile",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Shutdown => "shutdown",
            Self::Migrate => "migrate",
            Self::Teardown => "teardown",
        };
        write!(f, "{}", s)
    }
}

/// Reasons a request can be refused.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum RequestDeniedReason {
    #[error("Another lifecycle operation is in progress")]
    Busy,

    #[error("Domain has crashed")]
    Crashed,

    #[error("Domain is migrating")]
    MigrationInProgress,

    #[error("Operation requires a running domain")]
    NotRunning,

    #[error("Operation requires a paused domain")]
    NotPaused,

    #[error("Domain must be shut off first")]
    DomainActive,

    #[error("Domain is shutting down")]
    ShutdownInProgress,

    #[error("State driver has stopped")]
    DriverStopped,

    #[error("Domain has migrated to another host")]
    MigratedAway,
}

/// A reason for a change in the queue's request dispositions.
#[derive(Debug)]
enum DispositionChangeReason {
    RequestQueued(RequestKind),
    RequestCompleted,
    StateChange(DomainState),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RequestDisposition {
    Enqueue,

    /// Drop the request and report success. The domain is already in the
    /// state the request asks for.
    Ignore,

    Deny(RequestDeniedReason),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct AllowedRequests {
    reconcile: RequestDisposition,
    pause: RequestDisposition,
    resume: RequestDisposition,
    shutdown: RequestDisposition,
    migrate: RequestDisposition,
    teardown: RequestDisposition,
}

impl AllowedRequests {
    fn all(disposition: RequestDisposition) -> Self {
        Self {
            reconcile: disposition,
            pause: disposition,
            resume: disposition,
            shutdown: disposition,
            migrate: disposition,
            teardown: disposition,
        }
    }

    fn for_state(state: DomainState) -> Self {
        use RequestDeniedReason as DenyReason;
        use RequestDisposition as Disposition;

        match state {
            // The driver re-reads the domain's state before acting on any
            // request, so anything may be attempted.
            DomainState::Unknown => Self::all(Disposition::Enqueue),
            DomainState::Absent => Self {
                reconcile: Disposition::Enqueue,
                pause: Disposition::Deny(DenyReason::NotRunning),
                resume: Disposition::Deny(DenyReason::NotPaused),
                shutdown: Disposition::Ignore,
                migrate: Disposition::Deny(DenyReason::NotRunning),
                teardown: Disposition::Ignore,
            },
            DomainState::Defined | DomainState::Shutoff => Self {
                reconcile: Disposition::Enqueue,
                pause: Disposition::Deny(DenyReason::NotRunning),
                resume: Disposition::Deny(DenyReason::NotPaused),
                shutdown: Disposition::Ignore,
                migrate: Disposition::Deny(DenyReason::NotRunning),
                teardown: Disposition::Enqueue,
            },
            DomainState::Running => Self {
                reconcile: Disposition::Enqueue,
                pause: Disposition::Enqueue,
                resume: Disposition::Ignore,
                shutdown: Disposition::Enqueue,
                migrate: Disposition::Enqueue,
                teardown: Disposition::Deny(DenyReason::DomainActive),
            },
            DomainState::Paused => Self {
                reconcile: Disposition::Enqueue,
                pause: Disposition::Ignore,
                resume: Disposition::Enqueue,
                shutdown: Disposition::Enqueue,
                migrate: Disposition::Deny(DenyReason::NotRunning),
                teardown: Disposition::Deny(DenyReason::DomainActive),
            },
            DomainState::PmSuspended => Self {
                reconcile: Disposition::Enqueue,
                pause: Disposition::Deny(DenyReason::NotRunning),
                resume: Disposition::Deny(DenyReason::NotPaused),
                shutdown: Disposition::Enqueue,
                migrate: Disposition::Deny(DenyReason::NotRunning),
                teardown: Disposition::Deny(DenyReason::DomainActive),
            },

            // A guest that is ignoring its shutdown request can still be
            // stopped by force.
            DomainState::ShuttingDown => Self {
                shutdown: Disposition::Enqueue,
                teardown: Disposition::Deny(DenyReason::DomainActive),
                ..Self::all(Disposition::Deny(DenyReason::ShutdownInProgress))
            },

            // Crashed domains are never restarted here. They can only be
            // cleaned up.
            DomainState::Crashed => Self {
                shutdown: Disposition::Enqueue,
                teardown: Disposition::Enqueue,
                ..Self::all(Disposition::Deny(DenyReason::Crashed))
            },
            DomainState::Migrating(_) => {
                Self::all(Disposition::Deny(DenyReason::MigrationInProgress))
            }
        }
    }

    /// Dispositions once the domain has been handed off to another host.
    /// Nothing is left here to stop or undefine, and the domain must not be
    /// recreated alongside the migrated copy.
    fn migrated_away() -> Self {
        Self {
            shutdown: RequestDisposition::Ignore,
            teardown: RequestDisposition::Ignore,
            ..Self::all(RequestDisposition::Deny(
                RequestDeniedReason::MigratedAway,
            ))
        }
    }

    fn get(&self, kind: RequestKind) -> RequestDisposition {
        match kind {
            RequestKind::Reconcile => self.reconcile,
            RequestKind::Pause => self.pause,
            RequestKind::Resume => self.resume,
            RequestKind::Shutdown => self.shutdown,
            RequestKind::Migrate => self.migrate,
            RequestKind::Teardown => self.teardown,
        }
    }
}

/// What happened to a request the queue accepted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueOutcome {
    /// The request was queued and its reply will arrive on its channel.
    Enqueued,

    /// The request was dropped because it would have no effect. Its reply
    /// channel is closed without a value.
    Ignored,
}

#[derive(Debug)]
pub struct ExternalRequestQueue {
    pending: Option<ExternalRequest>,
    in_flight: bool,
    closed: bool,
    migrated_away: bool,
    state: DomainState,
    allowed: AllowedRequests,
    log: Logger,
}

impl ExternalRequestQueue {
    /// Creates an idle queue for a domain last seen in `state`.
    pub fn new(state: DomainState, log: Logger) -> Self {
        Self {
            pending: None,
            in_flight: false,
            closed: false,
            migrated_away: false,
            state,
            allowed: AllowedRequests::for_state(state),
            log,
        }
    }

    /// The confirmed domain state the queue's dispositions are based on.
    pub fn state(&self) -> DomainState {
        self.state
    }

    /// Takes the queued request, if any. The queue stays busy until
    /// [`Self::complete`] is called.
    pub fn pop(&mut self) -> Option<ExternalRequest> {
        self.pending.take()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
    }

    pub fn try_queue(
        &mut self,
        request: ExternalRequest,
    ) -> Result<QueueOutcome, RequestDeniedReason> {
        let kind = request.kind();
        let disposition = if self.closed {
            RequestDisposition::Deny(RequestDeniedReason::DriverStopped)
        } else {
            self.allowed.get(kind)
        };

        info!(&self.log, "Queuing external request";
              "request" => ?request,
              "disposition" => ?disposition);

        match disposition {
            RequestDisposition::Enqueue => {}
            RequestDisposition::Ignore => return Ok(QueueOutcome::Ignored),
            RequestDisposition::Deny(reason) => return Err(reason),
        }

        self.in_flight = true;
        self.allowed = self
            .get_new_dispositions(DispositionChangeReason::RequestQueued(kind));
        self.pending = Some(request);
        Ok(QueueOutcome::Enqueued)
    }

    /// Marks the in-flight request as finished so the next one may be
    /// admitted.
    pub fn complete(&mut self) {
        self.in_flight = false;
        self.pending = None;
        self.allowed =
            self.get_new_dispositions(DispositionChangeReason::RequestCompleted);
    }

    /// Refuses all further requests and drops any queued one, closing its
    /// reply channel.
    pub fn close(&mut self) {
        self.closed = true;
        self.pending = None;
    }

    /// Records that the domain now lives on another host. This is terminal:
    /// later state changes do not make the domain's requests admissible
    /// again.
    pub fn mark_migrated_away(&mut self) {
        self.migrated_away = true;
        if !self.in_flight {
            self.allowed = AllowedRequests::migrated_away();
        }
    }

    pub fn is_migrated_away(&self) -> bool {
        self.migrated_away
    }

    /// Tells the queue the domain's confirmed state changed.
    pub fn notify_state_change(&mut self, state: DomainState) {
        self.state = state;
        self.allowed =
            self.get_new_dispositions(DispositionChangeReason::StateChange(state));
    }

    fn get_new_dispositions(
        &self,
        reason: DispositionChangeReason,
    ) -> AllowedRequests {
        debug!(self.log, "Computing new queue dispositions";
               "reason" => ?reason,
               "in_flight" => self.in_flight);

        match reason {
            DispositionChangeReason::RequestQueued(_) => {
                AllowedRequests::all(RequestDisposition::Deny(
                    RequestDeniedReason::Busy,
                ))
            }
            DispositionChangeReason::RequestCompleted => self.settled(self.state),
            DispositionChangeReason::StateChange(state) => {
                if self.in_flight {
                    self.allowed
                } else {
                    self.settled(state)
                }
            }
        }
    }

    fn settled(&self, state: DomainState) -> AllowedRequests {
        if self.migrated_away {
            AllowedRequests::migrated_away()
        } else {
            AllowedRequests::for_state(state)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn pause() -> ExternalRequest {
        let (reply, _) = oneshot::channel();
        ExternalRequest::Pause { reply }
    }

    fn resume() -> ExternalRequest {
        let (reply, _) = oneshot::channel();
        ExternalRequest::Resume { reply }
    }

    fn shutdown() -> ExternalRequest {
        let (reply, _) = oneshot::channel();
        ExternalRequest::Shutdown {
            graceful: true,
            deadline: Duration::from_secs(1),
            reply,
        }
    }

    fn teardown() -> ExternalRequest {
        let (reply, _) = oneshot::channel();
        ExternalRequest::Teardown { reply }
    }

    fn migrate() -> ExternalRequest {
        let (reply, _) = oneshot::channel();
        ExternalRequest::Migrate {
            target: MigrationTarget {
                uri: "qemu+tls://dst/system".to_owned(),
                migrate_uri: None,
            },
            policy: MigrationPolicy::default(),
            cancel: CancellationToken::new(),
            reply,
        }
    }

    #[test]
    fn only_one_request_in_flight() {
        let mut queue =
            ExternalRequestQueue::new(DomainState::Running, test_logger());
        assert_eq!(queue.try_queue(pause()), Ok(QueueOutcome::Enqueued));
        assert!(queue.is_busy());

        // Even requests that would otherwise be ignored are refused.
        assert_eq!(queue.try_queue(resume()), Err(RequestDeniedReason::Busy));
        assert_eq!(queue.try_queue(pause()), Err(RequestDeniedReason::Busy));

        assert!(matches!(queue.pop(), Some(ExternalRequest::Pause { .. })));
        assert!(queue.pop().is_none());

        // Popping does not free the queue; completing does.
        assert_eq!(
            queue.try_queue(shutdown()),
            Err(RequestDeniedReason::Busy)
        );
        queue.notify_state_change(DomainState::Paused);
        assert_eq!(
            queue.try_queue(shutdown()),
            Err(RequestDeniedReason::Busy)
        );
        queue.complete();
        assert!(!queue.is_busy());
        assert_eq!(queue.try_queue(resume()), Ok(QueueOutcome::Enqueued));
    }

    #[test]
    fn redundant_requests_are_ignored() {
        let mut queue =
            ExternalRequestQueue::new(DomainState::Paused, test_logger());
        assert_eq!(queue.try_queue(pause()), Ok(QueueOutcome::Ignored));
        assert!(!queue.is_busy());

        queue.notify_state_change(DomainState::Running);
        assert_eq!(queue.try_queue(resume()), Ok(QueueOutcome::Ignored));

        queue.notify_state_change(DomainState::Shutoff);
        assert_eq!(queue.try_queue(shutdown()), Ok(QueueOutcome::Ignored));

        queue.notify_state_change(DomainState::Absent);
        assert_eq!(queue.try_queue(teardown()), Ok(QueueOutcome::Ignored));
    }

    #[test]
    fn crashed_domain_only_allows_cleanup() {
        let mut queue =
            ExternalRequestQueue::new(DomainState::Crashed, test_logger());
        assert_eq!(queue.try_queue(resume()), Err(RequestDeniedReason::Crashed));
        assert_eq!(
            queue.try_queue(migrate()),
            Err(RequestDeniedReason::Crashed)
        );

        let (reply, _) = oneshot::channel();
        let reconcile = ExternalRequest::Reconcile {
            spec: Box::new(crate::spec::test::test_spec("vm0")),
            placement: PlacementConstraints::default(),
            reply,
        };
        assert_eq!(
            queue.try_queue(reconcile),
            Err(RequestDeniedReason::Crashed)
        );

        assert_eq!(queue.try_queue(teardown()), Ok(QueueOutcome::Enqueued));
    }

    #[test]
    fn active_domain_cannot_be_torn_down() {
        let mut queue =
            ExternalRequestQueue::new(DomainState::Running, test_logger());
        assert_eq!(
            queue.try_queue(teardown()),
            Err(RequestDeniedReason::DomainActive)
        );

        queue.notify_state_change(DomainState::ShuttingDown);
        assert_eq!(
            queue.try_queue(pause()),
            Err(RequestDeniedReason::ShutdownInProgress)
        );
        assert_eq!(queue.try_queue(shutdown()), Ok(QueueOutcome::Enqueued));
    }

    #[test]
    fn unknown_state_defers_to_driver() {
        let mut queue =
            ExternalRequestQueue::new(DomainState::Unknown, test_logger());
        assert_eq!(queue.try_queue(migrate()), Ok(QueueOutcome::Enqueued));
        queue.pop();
        queue.complete();
        assert_eq!(queue.try_queue(teardown()), Ok(QueueOutcome::Enqueued));
    }

    #[test]
    fn closed_queue_refuses_everything() {
        let mut queue =
            ExternalRequestQueue::new(DomainState::Running, test_logger());
        let (reply, mut rx) = oneshot::channel();
        assert_eq!(
            queue.try_queue(ExternalRequest::Pause { reply }),
            Ok(QueueOutcome::Enqueued)
        );
        queue.close();
        assert!(rx.try_recv().is_err());
        assert!(queue.pop().is_none());

        queue.complete();
        assert_eq!(
            queue.try_queue(resume()),
            Err(RequestDeniedReason::DriverStopped)
        );
    }

    fn reconcile() -> ExternalRequest {
        let (reply, _) = oneshot::channel();
        ExternalRequest::Reconcile {
            spec: Box::new(crate::spec::test::test_spec("vm0")),
            placement: PlacementConstraints::default(),
            reply,
        }
    }

    #[test]
    fn migrated_domain_is_not_recreated() {
        let mut queue =
            ExternalRequestQueue::new(DomainState::Running, test_logger());
        assert_eq!(queue.try_queue(migrate()), Ok(QueueOutcome::Enqueued));
        queue.pop();

        // The handoff lands while the migrate request is still in flight.
        queue.mark_migrated_away();
        queue.notify_state_change(DomainState::Absent);
        assert_eq!(queue.try_queue(reconcile()), Err(RequestDeniedReason::Busy));
        queue.complete();

        assert!(queue.is_migrated_away());
        assert_eq!(
            queue.try_queue(reconcile()),
            Err(RequestDeniedReason::MigratedAway)
        );
        assert_eq!(
            queue.try_queue(pause()),
            Err(RequestDeniedReason::MigratedAway)
        );
        assert_eq!(
            queue.try_queue(resume()),
            Err(RequestDeniedReason::MigratedAway)
        );
        assert_eq!(
            queue.try_queue(migrate()),
            Err(RequestDeniedReason::MigratedAway)
        );
        assert_eq!(queue.try_queue(shutdown()), Ok(QueueOutcome::Ignored));
        assert_eq!(queue.try_queue(teardown()), Ok(QueueOutcome::Ignored));

        // A later state report does not lift the restriction.
        queue.notify_state_change(DomainState::Unknown);
        assert_eq!(
            queue.try_queue(reconcile()),
            Err(RequestDeniedReason::MigratedAway)
        );
    }

    #[test]
    fn absent_domain_without_migration_can_be_created() {
        let mut queue =
            ExternalRequestQueue::new(DomainState::Absent, test_logger());
        assert!(!queue.is_migrated_away());
        assert_eq!(queue.try_queue(reconcile()), Ok(QueueOutcome::Enqueued));
    }

    #[test]
    fn migration_requires_running_domain() {
        let mut queue =
            ExternalRequestQueue::new(DomainState::Paused, test_logger());
        assert_eq!(
            queue.try_queue(migrate()),
            Err(RequestDeniedReason::NotRunning)
        );
        queue.notify_state_change(DomainState::Running);
        assert_eq!(queue.try_queue(migrate()), Ok(QueueOutcome::Enqueued));
    }
}
