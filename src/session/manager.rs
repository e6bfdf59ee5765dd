//! Session manager
//!
//! Control operations (create/restart/delete/...) and the supervisor task
//! that applies lifecycle actions. The supervisor routes each signal to a
//! lane task owned by its instance, so a reconnect backing off on one id
//! never delays signals for another. Operations on one id are serialized by
//! a per-id lock; lanes take the same lock before acting, so a recreate can
//! never interleave with an explicit restart or delete.
//!
//! Every transport handle gets a fresh generation number. Signals from a
//! handle whose generation no longer matches the registry entry are ignored,
//! which is what keeps a detached handle from influencing its replacement.

use super::lifecycle::{transition, InstanceStatus, LifecycleAction, LifecycleFlags, LifecycleInput};
use super::registry::{EntryTasks, InstanceEntry, OpLocks, Registry};
use super::worker::Worker;
use super::{
    CreateOptions, InstanceSummary, SessionConfig, SessionError, SessionResult, Signal,
    UpdateOptions,
};
use crate::store::credentials::CredentialStore;
use crate::store::document::{Collection, DocumentStore};
use crate::store::instances::InstanceRecord;
use crate::store::messages::MessageStore;
use crate::transport::retry::{is_transport_error_retryable, retry_with_backoff};
use crate::transport::traits::{
    ConnectionState, ConnectionUpdate, InstanceId, OutgoingContent, SessionParams, Transport,
    TransportFactory, WireMessage,
};
use crate::webhook::EventDispatcher;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Multiplexes instances behind one control surface.
///
/// Cheap to clone. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    factory: Arc<dyn TransportFactory>,
    docs: Arc<dyn DocumentStore>,
    dispatcher: EventDispatcher,
    config: SessionConfig,
    registry: Registry,
    op_locks: OpLocks,
    signals: mpsc::UnboundedSender<Signal>,
    generations: AtomicU64,
    lanes: Lanes,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// One signal queue and handler task per instance id
#[derive(Default)]
struct Lanes {
    lanes: Mutex<HashMap<InstanceId, Lane>>,
}

struct Lane {
    sender: mpsc::UnboundedSender<Signal>,
    task: JoinHandle<()>,
}

impl Lanes {
    /// Queue `signal` on its instance's lane, spawning the lane if needed.
    fn route(&self, inner: &Weak<ManagerInner>, signal: Signal) {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let instance = signal.instance().clone();
        let signal = match lanes.get(&instance) {
            Some(lane) => match lane.sender.send(signal) {
                Ok(()) => return,
                Err(mpsc::error::SendError(signal)) => signal,
            },
            None => signal,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(signal);
        let task = tokio::spawn(run_lane(inner.clone(), receiver));
        lanes.insert(instance, Lane { sender, task });
    }

    /// Close the lane; queued signals still run, then the task ends.
    fn remove(&self, instance: &InstanceId) {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance);
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, lane)| lane.task)
            .collect()
    }
}

impl SessionManager {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        docs: Arc<dyn DocumentStore>,
        dispatcher: EventDispatcher,
        config: SessionConfig,
    ) -> Self {
        let (signals, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            factory,
            docs,
            dispatcher,
            config,
            registry: Registry::new(),
            op_locks: OpLocks::default(),
            signals,
            generations: AtomicU64::new(0),
            lanes: Lanes::default(),
            supervisor: Mutex::new(None),
        });

        let supervisor = tokio::spawn(supervise(Arc::downgrade(&inner), receiver));
        *inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(supervisor);

        Self { inner }
    }

    /// Start a new instance.
    ///
    /// Fails with `AlreadyExists` while the id is running. A persisted but
    /// stopped instance is started again with the new configuration and its
    /// existing credentials.
    pub async fn create(&self, id: &str, options: CreateOptions) -> SessionResult<()> {
        let instance = validate_id(id)?;
        let _guard = self.inner.op_locks.acquire(&instance).await;
        if self.inner.registry.contains(&instance) {
            return Err(SessionError::AlreadyExists(instance));
        }

        let record = InstanceRecord {
            id: instance.clone(),
            callback_url: options.callback_url,
            access_key: options.access_key,
            phone: options.phone,
            poll_events: options.poll_events.unwrap_or(true),
        };
        record.save(self.inner.docs.as_ref()).await?;
        self.inner
            .start_session(record, LifecycleFlags::default(), false)
            .await?;
        info!(instance = %instance, "instance created");
        Ok(())
    }

    /// Runtime status. Persisted instances that are not running report `closed`.
    pub async fn status(&self, id: &str) -> SessionResult<InstanceStatus> {
        let instance = InstanceId::new(id);
        if let Some(status) = self.inner.registry.status(&instance) {
            return Ok(status);
        }
        match InstanceRecord::load(self.inner.docs.as_ref(), &instance).await? {
            Some(_) => Ok(InstanceStatus::Closed),
            None => Err(SessionError::NotFound(instance)),
        }
    }

    /// Replace the transport session, keeping configuration and credentials.
    ///
    /// The old handle is fully detached and closed before the new one opens.
    pub async fn restart(&self, id: &str) -> SessionResult<()> {
        let instance = InstanceId::new(id);
        let _guard = self.inner.op_locks.acquire(&instance).await;

        let record = match self.inner.registry.remove(&instance) {
            Some(entry) => {
                let record = entry.record.clone();
                self.inner.retire(entry).await;
                record
            }
            None => InstanceRecord::load(self.inner.docs.as_ref(), &instance)
                .await?
                .ok_or_else(|| SessionError::NotFound(instance.clone()))?,
        };

        self.inner
            .start_session(record, LifecycleFlags::default(), false)
            .await?;
        info!(instance = %instance, "instance restarted");
        Ok(())
    }

    /// Stop the instance and remove every persisted document for it.
    pub async fn delete(&self, id: &str) -> SessionResult<()> {
        let instance = InstanceId::new(id);
        let _guard = self.inner.op_locks.acquire(&instance).await;

        let entry = self.inner.registry.remove(&instance);
        let persisted = InstanceRecord::load(self.inner.docs.as_ref(), &instance)
            .await?
            .is_some();
        if entry.is_none() && !persisted {
            return Err(SessionError::NotFound(instance));
        }

        if let Some(entry) = entry {
            if let Err(e) = entry.transport.logout().await {
                debug!(instance = %instance, error = %e, "logout failed during delete");
            }
            entry.detach().await;
        }

        for collection in Collection::ALL {
            self.inner
                .docs
                .delete(collection, instance.as_str())
                .await?;
        }
        self.inner.lanes.remove(&instance);
        drop(_guard);
        self.inner.op_locks.prune(&instance);
        info!(instance = %instance, "instance deleted");
        Ok(())
    }

    /// Send content through an open instance and record it in the Message Store.
    pub async fn send(
        &self,
        id: &str,
        conversation: &str,
        content: OutgoingContent,
    ) -> SessionResult<WireMessage> {
        let instance = InstanceId::new(id);
        if conversation.trim().is_empty() {
            return Err(SessionError::InvalidRequest(
                "conversation must not be empty".to_string(),
            ));
        }
        if let OutgoingContent::Media { mimetype, data, .. } = &content {
            if mimetype.trim().is_empty() || data.is_empty() {
                return Err(SessionError::InvalidRequest(
                    "media and mimetype are required".to_string(),
                ));
            }
        }

        let running = self
            .inner
            .registry
            .with(&instance, |e| (e.status, e.transport.clone(), e.messages.clone()));
        let (transport, messages) = match running {
            Some((InstanceStatus::Open, transport, messages)) => (transport, messages),
            Some((status, _, _)) => {
                return Err(SessionError::NotActive { instance, status });
            }
            None => {
                return Err(self.not_running(instance).await);
            }
        };

        let message = transport.send(conversation, content).await?;
        messages
            .insert(conversation, vec![message.clone()])
            .await;
        messages.write_logged().await;
        Ok(message)
    }

    /// Every known instance (persisted or running), sorted by id
    pub async fn list_instances(&self) -> SessionResult<Vec<InstanceSummary>> {
        let mut summaries: BTreeMap<InstanceId, InstanceStatus> =
            InstanceRecord::list(self.inner.docs.as_ref())
                .await?
                .into_iter()
                .map(|record| (record.id, InstanceStatus::Closed))
                .collect();
        summaries.extend(self.inner.registry.statuses());

        Ok(summaries
            .into_iter()
            .map(|(id, status)| InstanceSummary { id, status })
            .collect())
    }

    /// Change the callback URL and/or access key
    pub async fn update(&self, id: &str, options: UpdateOptions) -> SessionResult<()> {
        let instance = InstanceId::new(id);
        let _guard = self.inner.op_locks.acquire(&instance).await;

        let mut record = match self.inner.registry.with(&instance, |e| e.record.clone()) {
            Some(record) => record,
            None => InstanceRecord::load(self.inner.docs.as_ref(), &instance)
                .await?
                .ok_or_else(|| SessionError::NotFound(instance.clone()))?,
        };
        if let Some(callback_url) = options.callback_url {
            record.callback_url = callback_url;
        }
        if let Some(access_key) = options.access_key {
            record.access_key = access_key;
        }

        record.save(self.inner.docs.as_ref()).await?;
        self.inner
            .registry
            .with(&instance, move |e| e.record = record);
        Ok(())
    }

    /// Most recent pairing code, while the instance is pairing
    pub async fn pairing_code(&self, id: &str) -> SessionResult<Option<String>> {
        let instance = InstanceId::new(id);
        match self.inner.registry.with(&instance, |e| e.pairing_code.clone()) {
            Some(code) => Ok(code),
            None => match InstanceRecord::load(self.inner.docs.as_ref(), &instance).await? {
                Some(_) => Ok(None),
                None => Err(SessionError::NotFound(instance)),
            },
        }
    }

    /// Check a caller-supplied access key. Instances without a key accept any caller.
    pub async fn authorize(&self, id: &str, key: Option<&str>) -> SessionResult<()> {
        let instance = InstanceId::new(id);
        let record = match self.inner.registry.with(&instance, |e| e.record.clone()) {
            Some(record) => record,
            None => InstanceRecord::load(self.inner.docs.as_ref(), &instance)
                .await?
                .ok_or_else(|| SessionError::NotFound(instance.clone()))?,
        };

        let Some(expected) = record.access_key.as_deref().filter(|k| !k.is_empty()) else {
            return Ok(());
        };
        let presented = key.unwrap_or_default();
        ring::constant_time::verify_slices_are_equal(expected.as_bytes(), presented.as_bytes())
            .map_err(|_| SessionError::Unauthorized(instance))
    }

    /// Start every persisted instance that is not already running.
    ///
    /// Returns the number started. Failures are logged and skipped.
    pub async fn restore_instances(&self) -> SessionResult<usize> {
        let records = InstanceRecord::list(self.inner.docs.as_ref()).await?;
        let mut started = 0;
        for record in records {
            let instance = record.id.clone();
            let _guard = self.inner.op_locks.acquire(&instance).await;
            if self.inner.registry.contains(&instance) {
                continue;
            }
            match self
                .inner
                .start_session(record, LifecycleFlags::default(), false)
                .await
            {
                Ok(()) => started += 1,
                Err(e) => warn!(instance = %instance, error = %e, "failed to restore instance"),
            }
        }
        info!(started, "restored persisted instances");
        Ok(started)
    }

    /// Stop the supervisor and every running session. Persisted state is kept.
    pub async fn shutdown(&self) {
        let supervisor = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            supervisor.abort();
            let _ = supervisor.await;
        }
        for lane in self.inner.lanes.take_tasks() {
            lane.abort();
            let _ = lane.await;
        }

        for entry in self.inner.registry.drain() {
            self.inner.retire(entry).await;
        }
        info!("session manager stopped");
    }

    async fn not_running(&self, instance: InstanceId) -> SessionError {
        match InstanceRecord::load(self.inner.docs.as_ref(), &instance).await {
            Ok(Some(_)) => SessionError::NotActive {
                instance,
                status: InstanceStatus::Closed,
            },
            Ok(None) => SessionError::NotFound(instance),
            Err(e) => e.into(),
        }
    }
}

impl ManagerInner {
    /// Open a transport session for `record` and register it as `connecting`.
    ///
    /// Caller holds the op lock for the id and has removed any previous entry.
    async fn start_session(
        &self,
        record: InstanceRecord,
        flags: LifecycleFlags,
        retry_open: bool,
    ) -> SessionResult<()> {
        let instance = record.id.clone();
        let credentials =
            Arc::new(CredentialStore::load(instance.clone(), self.docs.clone()).await?);
        let messages = Arc::new(MessageStore::load(instance.clone(), self.docs.clone()).await?);
        let identity = credentials.credentials().await;
        let registered = identity.registered;

        let params = SessionParams {
            instance: instance.clone(),
            credentials: identity,
            keys: credentials.clone(),
            messages: messages.clone(),
        };
        let open = || {
            let factory = self.factory.clone();
            let params = params.clone();
            async move { factory.open(params).await }
        };
        let (transport, events) = if retry_open {
            retry_with_backoff(self.config.retry, open, is_transport_error_retryable).await?
        } else {
            open().await?
        };

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let phone = record.phone.clone().filter(|_| !registered);
        self.registry.insert(InstanceEntry {
            record,
            status: InstanceStatus::Connecting,
            flags,
            generation,
            transport: transport.clone(),
            credentials: credentials.clone(),
            messages: messages.clone(),
            pairing_code: None,
            tasks: EntryTasks::default(),
        });

        // Entry is registered first so the worker's generation check passes
        let worker = Worker {
            instance: instance.clone(),
            generation,
            transport: transport.clone(),
            credentials,
            messages,
            dispatcher: self.dispatcher.clone(),
            registry: self.registry.clone(),
            signals: self.signals.clone(),
        };
        let mut worker_task = Some(tokio::spawn(worker.run(events)));
        let mut pairing_task =
            phone.map(|phone| self.spawn_pairing_request(&instance, generation, transport, phone));

        self.registry.with_generation(&instance, generation, |e| {
            e.tasks.worker = worker_task.take();
            e.tasks.pairing_request = pairing_task.take();
        });
        for orphan in worker_task.into_iter().chain(pairing_task) {
            orphan.abort();
        }

        debug!(instance = %instance, generation, "session started");
        Ok(())
    }

    fn spawn_pairing_request(
        &self,
        instance: &InstanceId,
        generation: u64,
        transport: Arc<dyn Transport>,
        phone: String,
    ) -> JoinHandle<()> {
        let instance = instance.clone();
        let signals = self.signals.clone();
        let policy = self.config.retry;
        tokio::spawn(async move {
            let request = || {
                let transport = transport.clone();
                let phone = phone.clone();
                async move { transport.request_pairing_code(&phone).await }
            };
            match retry_with_backoff(policy, request, is_transport_error_retryable).await {
                Ok(code) => {
                    let _ = signals.send(Signal::PairingCode {
                        instance,
                        generation,
                        code,
                    });
                }
                Err(e) => warn!(instance = %instance, error = %e, "pairing code request failed"),
            }
        })
    }

    fn spawn_timer(&self, delay: Duration, signal: Signal) -> JoinHandle<()> {
        let signals = self.signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signals.send(signal);
        })
    }

    /// Flush a removed entry's stores, then detach it.
    async fn retire(&self, entry: InstanceEntry) {
        if let Err(e) = entry.credentials.save().await {
            warn!(instance = %entry.record.id, error = %e, "failed to flush credentials");
        }
        entry.messages.write_logged().await;
        entry.detach().await;
    }

    async fn handle_signal(&self, signal: Signal) {
        let (instance, generation, inputs, pairing_code) = match signal {
            Signal::Connection {
                instance,
                generation,
                update,
            } => {
                let inputs = connection_inputs(&update);
                (instance, generation, inputs, update.qr)
            }
            Signal::PairingCode {
                instance,
                generation,
                code,
            } => (instance, generation, vec![LifecycleInput::PairingCode], Some(code)),
            Signal::PairingTimeout {
                instance,
                generation,
            } => (instance, generation, vec![LifecycleInput::PairingTimeout], None),
            Signal::RestartTimer {
                instance,
                generation,
            } => (instance, generation, vec![LifecycleInput::RestartTimer], None),
        };
        if inputs.is_empty() {
            return;
        }

        let _guard = self.op_locks.acquire(&instance).await;
        if let Some(code) = pairing_code {
            self.registry
                .with_generation(&instance, generation, |e| e.pairing_code = Some(code));
        }
        for input in inputs {
            if !self.apply(&instance, generation, input).await {
                debug!(instance = %instance, generation, ?input, "ignoring signal from detached handle");
                break;
            }
        }
    }

    /// Run one input through the transition table and execute its actions.
    ///
    /// Returns false when `generation` is no longer the registered handle.
    async fn apply(&self, instance: &InstanceId, generation: u64, input: LifecycleInput) -> bool {
        let max_attempts = self.config.max_pairing_attempts;
        let outcome = self.registry.with_generation(instance, generation, |entry| {
            let previous = entry.status;
            let t = transition(entry.status, entry.flags, input, max_attempts);
            entry.status = t.status;
            entry.flags = t.flags;
            if t.status == InstanceStatus::Open {
                entry.pairing_code = None;
            }
            (previous, t)
        });
        let Some((previous, t)) = outcome else {
            return false;
        };

        if previous != t.status {
            info!(instance = %instance, from = %previous, to = %t.status, "instance status changed");
        }
        for action in t.actions {
            self.execute(instance, generation, action).await;
        }
        true
    }

    async fn execute(&self, instance: &InstanceId, generation: u64, action: LifecycleAction) {
        match action {
            LifecycleAction::CancelWatchdog => {
                self.registry
                    .with_generation(instance, generation, |e| e.tasks.cancel_watchdog());
            }
            LifecycleAction::StartWatchdog => {
                let mut timer = Some(self.spawn_timer(
                    self.config.pairing_timeout,
                    Signal::PairingTimeout {
                        instance: instance.clone(),
                        generation,
                    },
                ));
                self.registry.with_generation(instance, generation, |e| {
                    e.tasks.cancel_watchdog();
                    e.tasks.watchdog = timer.take();
                });
                if let Some(orphan) = timer {
                    orphan.abort();
                }
            }
            LifecycleAction::ScheduleRestart | LifecycleAction::RecreateAfterDelay => {
                let mut timer = Some(self.spawn_timer(
                    self.config.restart_delay,
                    Signal::RestartTimer {
                        instance: instance.clone(),
                        generation,
                    },
                ));
                self.registry.with_generation(instance, generation, |e| {
                    e.tasks.cancel_restart_timer();
                    e.tasks.restart_timer = timer.take();
                });
                if let Some(orphan) = timer {
                    orphan.abort();
                }
            }
            LifecycleAction::Recreate => self.recreate(instance, generation, false).await,
            LifecycleAction::RecreateFresh => self.recreate(instance, generation, true).await,
            LifecycleAction::Teardown => {
                if let Some(entry) = self.registry.remove_generation(instance, generation) {
                    self.retire(entry).await;
                    info!(instance = %instance, "instance logged out");
                }
            }
            LifecycleAction::RemainClosed => {
                let stopped = self.registry.with_generation(instance, generation, |e| {
                    (std::mem::take(&mut e.tasks), e.transport.clone())
                });
                if let Some((tasks, transport)) = stopped {
                    tasks.stop().await;
                    transport.close().await;
                    info!(instance = %instance, "instance stays closed");
                }
            }
        }
    }

    /// Replace the session for `generation` with a new handle.
    ///
    /// `fresh` discards the identity so the next session pairs from scratch.
    async fn recreate(&self, instance: &InstanceId, generation: u64, fresh: bool) {
        let Some(entry) = self.registry.remove_generation(instance, generation) else {
            return;
        };
        let record = entry.record.clone();
        let flags = entry.flags.carried();
        let credentials = entry.credentials.clone();
        self.retire(entry).await;
        if fresh {
            credentials.reset().await;
        }

        info!(instance = %instance, fresh, "recreating session");
        if let Err(e) = self.start_session(record, flags, true).await {
            warn!(instance = %instance, error = %e, "failed to recreate session");
        }
    }
}

/// Supervisor loop. Ends when the manager is dropped or shut down.
async fn supervise(inner: Weak<ManagerInner>, mut signals: mpsc::UnboundedReceiver<Signal>) {
    while let Some(signal) = signals.recv().await {
        let Some(strong) = inner.upgrade() else {
            break;
        };
        strong.lanes.route(&inner, signal);
    }
    debug!("supervisor stopped");
}

/// Signals for one instance, handled in arrival order
async fn run_lane(inner: Weak<ManagerInner>, mut signals: mpsc::UnboundedReceiver<Signal>) {
    while let Some(signal) = signals.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_signal(signal).await;
    }
}

/// Lifecycle inputs carried by one `connection.update`, in evaluation order
fn connection_inputs(update: &ConnectionUpdate) -> Vec<LifecycleInput> {
    let mut inputs = Vec::new();
    if update.qr.is_some() {
        inputs.push(LifecycleInput::PairingCode);
    }
    match update.connection {
        Some(ConnectionState::Open) => inputs.push(LifecycleInput::Open),
        Some(ConnectionState::Close) => inputs.push(LifecycleInput::Close(update.last_disconnect)),
        Some(ConnectionState::Connecting) | None => {}
    }
    if update.is_new_login {
        inputs.push(LifecycleInput::NewLogin);
    }
    inputs
}

fn validate_id(id: &str) -> SessionResult<InstanceId> {
    if id.is_empty() || id.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(SessionError::InvalidRequest(format!(
            "invalid instance id: {:?}",
            id
        )));
    }
    Ok(InstanceId::new(id))
}
