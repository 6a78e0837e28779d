/// Per-document synchronization session
///
/// Owns the document version, pending and historical operations, the conflict
/// queue and the presence roster, and routes inbound transport events.
use futures::{Stream, StreamExt};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::presence::lock_tracker;
use crate::{
    CollabError, Collaborator, CollaboratorId, Conflict, ConflictDetector, ConflictId,
    ConflictResolver, Cursor, DocumentId, DocumentVersion, IdleMonitor, InboundEvent, Operation,
    OperationBody, OperationLog, OutboundMessage, PresenceState, PresenceTracker, Resolution,
    Result, SyncConfig, Transport, WireOperation,
};

pub type OperationCallback = Box<dyn FnMut(&Operation, &CollaboratorId) + Send>;
pub type ConflictCallback = Box<dyn FnMut(&Conflict) + Send>;

/// What happened to a received remote operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// No pending local operation collided; the operation was delivered
    Applied,

    /// One conflict was queued per colliding local operation
    Conflicted(Vec<ConflictId>),
}

/// Synchronization state for one open document
pub struct SyncSession {
    document_id: DocumentId,
    local_user: CollaboratorId,
    config: SyncConfig,
    transport: Option<Box<dyn Transport>>,
    document_version: DocumentVersion,
    pending_operations: Vec<Operation>,
    history: OperationLog,
    conflicts: Vec<Conflict>,
    presence: Arc<Mutex<PresenceTracker>>,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    operation_callbacks: Vec<OperationCallback>,
    conflict_callbacks: Vec<ConflictCallback>,
    idle_monitor: Option<IdleMonitor>,
}

impl SyncSession {
    pub fn new(document_id: DocumentId, local_user: CollaboratorId, config: SyncConfig) -> Self {
        Self {
            document_id,
            local_user,
            detector: ConflictDetector::new(config.proximity_threshold),
            presence: Arc::new(Mutex::new(PresenceTracker::new(config.idle_timeout()))),
            config,
            transport: None,
            document_version: 0,
            pending_operations: Vec::new(),
            history: OperationLog::new(),
            conflicts: Vec::new(),
            resolver: ConflictResolver::new(),
            operation_callbacks: Vec::new(),
            conflict_callbacks: Vec::new(),
            idle_monitor: None,
        }
    }

    /// Attach a transport and start from a clean state at version 0.
    ///
    /// Nothing survives a reconnect: the server is authoritative and
    /// replays the roster and operations over the new connection.
    pub fn connect(&mut self, transport: impl Transport + 'static) {
        if self.transport.is_some() {
            self.disconnect();
        }

        self.document_version = 0;
        self.pending_operations.clear();
        self.history.clear();
        self.conflicts.clear();
        lock_tracker(&self.presence).clear();
        self.transport = Some(Box::new(transport));

        if tokio::runtime::Handle::try_current().is_ok() {
            self.idle_monitor = Some(IdleMonitor::spawn(
                self.presence.clone(),
                self.config.idle_check_interval(),
            ));
        } else {
            tracing::debug!("no tokio runtime, idle checks must be driven by the host");
        }

        tracing::info!(
            "connected to document {} as {}",
            self.document_id,
            self.local_user
        );
    }

    /// Drop the transport, pending operations, conflicts and roster.
    /// History is kept until the next connect.
    pub fn disconnect(&mut self) {
        if self.transport.take().is_none() {
            return;
        }

        if !self.pending_operations.is_empty() || !self.conflicts.is_empty() {
            tracing::warn!(
                "disconnecting from {} with {} pending operations and {} unresolved conflicts",
                self.document_id,
                self.pending_operations.len(),
                self.conflicts.len()
            );
        }

        self.pending_operations.clear();
        self.conflicts.clear();
        lock_tracker(&self.presence).clear();
        if let Some(monitor) = self.idle_monitor.take() {
            monitor.stop();
        }

        tracing::info!("disconnected from document {}", self.document_id);
    }

    pub fn is_connected(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|transport| transport.is_connected())
    }

    /// Create, record and transmit a local operation
    pub fn dispatch_local_operation(&mut self, body: OperationBody) -> Result<Operation> {
        if !self.is_connected() {
            return Err(CollabError::NotConnected);
        }

        let op = Operation::new(self.local_user.clone(), self.document_version, body);
        op.validate()?;

        self.pending_operations.push(op.clone());
        self.history.append(op.clone());
        self.transmit(OutboundMessage::Operation {
            operation: WireOperation::from(&op),
        });
        self.document_version += 1;

        lock_tracker(&self.presence).record_operation(&self.local_user, chrono::Utc::now());

        tracing::debug!(
            "dispatched {} operation {} at version {}",
            op.kind(),
            op.id,
            op.version
        );

        Ok(op)
    }

    /// Route a remote operation through conflict detection
    pub fn receive_remote_operation(
        &mut self,
        remote: Operation,
        from: &CollaboratorId,
    ) -> Result<ReceiveOutcome> {
        if !self.is_connected() {
            return Err(CollabError::NotConnected);
        }
        remote.validate()?;

        self.history.append(remote.clone());
        lock_tracker(&self.presence).record_operation(from, chrono::Utc::now());

        let detector = self.detector;
        let (conflicting, remaining): (Vec<Operation>, Vec<Operation>) =
            std::mem::take(&mut self.pending_operations)
                .into_iter()
                .partition(|pending| {
                    pending.id != remote.id && detector.detect_conflict(pending, &remote)
                });
        self.pending_operations = remaining;

        if conflicting.is_empty() {
            self.document_version = self.document_version.max(remote.version);

            tracing::debug!(
                "applied {} operation {} from {}, document at version {}",
                remote.kind(),
                remote.id,
                from,
                self.document_version
            );

            for callback in self.operation_callbacks.iter_mut() {
                callback(&remote, from);
            }

            return Ok(ReceiveOutcome::Applied);
        }

        let mut ids = Vec::with_capacity(conflicting.len());
        for local in conflicting {
            let conflict = Conflict::new(local, remote.clone());

            tracing::warn!(
                "operation {} from {} conflicts with local operation {}",
                remote.id,
                from,
                conflict.local_operation.id
            );

            for callback in self.conflict_callbacks.iter_mut() {
                callback(&conflict);
            }

            ids.push(conflict.id);
            self.conflicts.push(conflict);
        }

        Ok(ReceiveOutcome::Conflicted(ids))
    }

    /// Decode a wire operation and receive it. Malformed input is dropped
    /// without touching session state.
    pub fn receive_wire_operation(
        &mut self,
        wire: WireOperation,
        from: &CollaboratorId,
    ) -> Result<ReceiveOutcome> {
        let remote = wire.into_operation(from.clone()).map_err(|e| {
            tracing::warn!("dropping malformed operation from {}: {}", from, e);
            e
        })?;

        self.receive_remote_operation(remote, from)
    }

    /// Settle a queued conflict and dispatch the winning operation as a new
    /// local operation
    pub fn resolve_conflict(
        &mut self,
        conflict_id: ConflictId,
        resolution: Resolution,
    ) -> Result<Operation> {
        let idx = self
            .conflicts
            .iter()
            .position(|c| c.id == conflict_id)
            .ok_or(CollabError::ConflictNotFound(conflict_id))?;

        let winner = self.resolver.resolve(&self.conflicts[idx], resolution);
        let dispatched = self.dispatch_local_operation(winner.body)?;

        let mut conflict = self.conflicts.remove(idx);
        conflict.resolved = true;
        conflict.resolution = Some(resolution);

        tracing::info!(
            "resolved conflict {} with {:?}, dispatched {}",
            conflict.id,
            resolution,
            dispatched.id
        );

        Ok(dispatched)
    }

    /// Send the local cursor and mark the local user as editing
    pub fn send_cursor(&mut self, cursor: Cursor) -> Result<()> {
        if !self.is_connected() {
            return Err(CollabError::NotConnected);
        }

        self.transmit(OutboundMessage::Cursor { cursor });

        let mut presence = lock_tracker(&self.presence);
        if let Some(me) = presence.get_mut(&self.local_user) {
            me.cursor = Some(cursor);
            me.presence = PresenceState::Editing;
            me.touch(chrono::Utc::now());
        }

        Ok(())
    }

    /// Apply one event delivered by the transport
    pub fn handle_event(&mut self, event: InboundEvent) -> Result<()> {
        let now = chrono::Utc::now();

        match event {
            InboundEvent::CollaboratorJoined { collaborator } => {
                tracing::info!("{} joined document {}", collaborator.display_name, self.document_id);
                lock_tracker(&self.presence).join(collaborator, now);
            }

            InboundEvent::CollaboratorLeft { collaborator_id } => {
                if lock_tracker(&self.presence).leave(&collaborator_id).is_some() {
                    tracing::info!("{} left document {}", collaborator_id, self.document_id);
                }
            }

            InboundEvent::OperationReceived { operation, from } => {
                self.receive_wire_operation(operation, &from)?;
            }

            InboundEvent::CursorUpdated {
                collaborator_id,
                cursor,
            } => {
                lock_tracker(&self.presence).update_cursor(&collaborator_id, cursor, now);
            }

            InboundEvent::RosterSnapshot { collaborators } => {
                tracing::debug!("roster snapshot with {} collaborators", collaborators.len());
                lock_tracker(&self.presence).replace_roster(collaborators, now);
            }
        }

        Ok(())
    }

    pub fn register_operation_callback(
        &mut self,
        callback: impl FnMut(&Operation, &CollaboratorId) + Send + 'static,
    ) {
        self.operation_callbacks.push(Box::new(callback));
    }

    pub fn register_conflict_callback(&mut self, callback: impl FnMut(&Conflict) + Send + 'static) {
        self.conflict_callbacks.push(Box::new(callback));
    }

    /// Run the idle check now, for hosts that drive their own timer
    pub fn check_idle(&self) -> Vec<CollaboratorId> {
        lock_tracker(&self.presence).check_idle(chrono::Utc::now())
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn local_user(&self) -> &CollaboratorId {
        &self.local_user
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn document_version(&self) -> DocumentVersion {
        self.document_version
    }

    pub fn pending_operations(&self) -> &[Operation] {
        &self.pending_operations
    }

    pub fn history(&self) -> &[Operation] {
        self.history.as_slice()
    }

    pub fn operation_log(&self) -> &OperationLog {
        &self.history
    }

    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    pub fn conflict(&self, id: ConflictId) -> Option<&Conflict> {
        self.conflicts.iter().find(|c| c.id == id)
    }

    /// Snapshot of the roster in join order
    pub fn collaborators(&self) -> Vec<Collaborator> {
        lock_tracker(&self.presence)
            .collaborators()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn collaborator(&self, id: &CollaboratorId) -> Option<Collaborator> {
        lock_tracker(&self.presence).get(id).cloned()
    }

    pub fn is_idle_monitor_running(&self) -> bool {
        self.idle_monitor
            .as_ref()
            .is_some_and(|monitor| monitor.is_running())
    }

    fn transmit(&self, message: OutboundMessage) {
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.send(message) {
                tracing::warn!("failed to transmit to {}: {}", self.document_id, e);
            }
        }
    }
}

impl fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSession")
            .field("document_id", &self.document_id)
            .field("local_user", &self.local_user)
            .field("connected", &self.is_connected())
            .field("document_version", &self.document_version)
            .field("pending_operations", &self.pending_operations.len())
            .field("history", &self.history.len())
            .field("conflicts", &self.conflicts.len())
            .finish_non_exhaustive()
    }
}

/// Feed inbound events into a shared session in arrival order.
///
/// Events that fail are logged and dropped. Returns how many were handled
/// successfully once the stream ends.
pub async fn pump<S>(session: Arc<tokio::sync::Mutex<SyncSession>>, events: S) -> usize
where
    S: Stream<Item = InboundEvent>,
{
    futures::pin_mut!(events);

    let mut handled = 0;
    while let Some(event) = events.next().await {
        let mut session = session.lock().await;
        match session.handle_event(event) {
            Ok(()) => handled += 1,
            Err(e) => tracing::warn!("dropping inbound event for {}: {}", session.document_id(), e),
        }
    }

    handled
}
