//! Per-connection sessions and the connection loop.
//!
//! A [`Session`] owns one interpreter environment for exactly as long as its
//! connection lives. The [`SessionManager`] drives the connection through
//! `AwaitingCode -> Executing -> AwaitingCode ... -> Closed`, serializing
//! submissions so only one execution is ever in flight per connection.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{ExecutionBackend, ExecutionResult, SessionEngine};
use crate::transport::{Connection, Reply, TransportError};

/// Connection loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingCode,
    Executing,
    Closed,
}

/// Why a connection loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection.
    PeerClosed,
    /// Reading or writing the connection failed.
    TransportFault(String),
    /// No interpreter could be started for the connection.
    SessionUnavailable(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed"),
            Self::TransportFault(e) => write!(f, "transport fault: {e}"),
            Self::SessionUnavailable(e) => write!(f, "session unavailable: {e}"),
        }
    }
}

/// What a finished connection loop reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: Uuid,
    pub executions: u64,
    pub reason: CloseReason,
}

/// One connection's persistent execution state.
pub struct Session {
    pub id: Uuid,
    pub created_at: Instant,
    deadline: Duration,
    executions: u64,
    engine: Box<dyn SessionEngine>,
}

impl Session {
    fn new(engine: Box<dyn SessionEngine>, deadline: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Instant::now(),
            deadline,
            executions: 0,
            engine,
        }
    }

    /// Deadline the engine applies to each submission.
    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Evaluate one submission against the session environment.
    pub async fn execute(&mut self, code: &str) -> ExecutionResult {
        self.executions += 1;
        self.engine.execute(code).await
    }

    pub const fn executions(&self) -> u64 {
        self.executions
    }

    /// Discard the environment.
    async fn shutdown(self) {
        self.engine.shutdown().await;
    }
}

/// Drives one connection from accept to close.
pub struct SessionManager<C: Connection> {
    connection: C,
    session: Session,
    state: SessionState,
}

impl<C: Connection> SessionManager<C> {
    /// Serve `connection` until it closes, with a fresh session from `backend`.
    pub async fn serve(mut connection: C, backend: Arc<dyn ExecutionBackend>) -> SessionSummary {
        match backend.open_session().await {
            Ok(engine) => {
                let session = Session::new(engine, backend.deadline());
                Self::new(connection, session).run().await
            }
            Err(e) => {
                warn!(error = %e, "Failed to start session");
                let summary = SessionSummary {
                    id: Uuid::nil(),
                    executions: 0,
                    reason: CloseReason::SessionUnavailable(format!("{e:#}")),
                };
                if connection.is_open() {
                    let reply = Reply::diagnostic(format!("{e:#}"));
                    if let Err(e) = connection.send_reply(&reply).await {
                        debug!(error = %e, "Could not report session failure");
                    }
                }
                close_connection(&mut connection).await;
                summary
            }
        }
    }

    pub const fn new(connection: C, session: Session) -> Self {
        Self {
            connection,
            session,
            state: SessionState::AwaitingCode,
        }
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Run the loop to completion. Teardown happens exactly once, here.
    #[instrument(skip(self), fields(session = %self.session.id))]
    pub async fn run(mut self) -> SessionSummary {
        info!(deadline = ?self.session.deadline(), "Session opened");

        let reason = loop {
            if let Err(reason) = self.step().await {
                break reason;
            }
        };
        self.state = SessionState::Closed;

        close_connection(&mut self.connection).await;
        let summary = SessionSummary {
            id: self.session.id,
            executions: self.session.executions(),
            reason,
        };
        let lifetime = self.session.created_at.elapsed();
        self.session.shutdown().await;

        info!(
            executions = summary.executions,
            reason = %summary.reason,
            ?lifetime,
            "Session closed"
        );
        summary
    }

    /// One pass through `AwaitingCode` (and `Executing` for non-empty code).
    async fn step(&mut self) -> Result<(), CloseReason> {
        debug_assert_eq!(self.state, SessionState::AwaitingCode);

        let code = match self.connection.recv_code().await {
            Ok(Some(code)) => code,
            Ok(None) => {
                debug!("Peer disconnected");
                return Err(CloseReason::PeerClosed);
            }
            Err(e) => return Err(self.transport_fault(e).await),
        };

        if code.is_empty() {
            debug!("Ignoring empty submission");
            return Ok(());
        }

        self.state = SessionState::Executing;
        debug!(code_len = code.len(), "Executing submission");
        let result = self.session.execute(&code).await;
        self.state = SessionState::AwaitingCode;

        if !self.connection.is_open() {
            debug!("Connection closed during execution, dropping result");
            return Err(CloseReason::PeerClosed);
        }
        if let Err(e) = self.connection.send_reply(&Reply::from(result)).await {
            return Err(self.transport_fault(e).await);
        }
        Ok(())
    }

    /// Log the fault and try to tell the client before giving up.
    async fn transport_fault(&mut self, error: TransportError) -> CloseReason {
        warn!(error = %error, "Connection error");
        if self.connection.is_open() {
            if let Err(e) = self
                .connection
                .send_reply(&Reply::diagnostic(&error))
                .await
            {
                debug!(error = %e, "Diagnostic reply not delivered");
            }
        }
        CloseReason::TransportFault(error.to_string())
    }
}

async fn close_connection<C: Connection>(connection: &mut C) {
    if !connection.is_open() {
        return;
    }
    if let Err(e) = connection.close().await {
        debug!(error = %e, "Error closing connection");
    }
}
