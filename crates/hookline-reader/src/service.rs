//! Hosting hooks for a Reader.
//!
//! A host drives a Reader through [`Lifecycle`]: `open` with the init
//! payload, `run` while this replica is primary, `change_role` when the
//! host demotes or promotes it, and `close` on the way out. [`ReaderService`]
//! is the one implementation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hookline_core::{Clock, ReaderEventHandler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    broker::Broker,
    config::ReaderConfig,
    dispatch::DeliveryDispatcher,
    error::{ReaderError, Result},
    heartbeat::HeartbeatReporter,
    pump::ReaderPump,
    reader::Reader,
};

/// Role a host assigns to a Reader replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    /// Drains the subscription.
    Primary,
    /// Standby that may be promoted.
    Secondary,
    /// No role assigned.
    None,
}

/// Hooks a hosting runtime calls on a Reader.
#[async_trait::async_trait]
pub trait Lifecycle: Send + Sync {
    /// Decodes the init payload and prepares the Reader. Fails fast on a
    /// malformed payload.
    async fn open(&self, init_payload: &[u8]) -> Result<()>;

    /// Runs until `cancel` fires or the replica is demoted.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;

    /// Stops running work and releases broker resources.
    async fn close(&self) -> Result<()>;

    /// Applies a role change; leaving `Primary` stops the running loop.
    async fn change_role(&self, role: ReplicaRole) -> Result<()>;
}

#[derive(Debug)]
struct ServiceState {
    reader: Option<Arc<Reader>>,
    role: ReplicaRole,
    running: Option<CancellationToken>,
}

/// Reader hosted behind [`Lifecycle`].
#[derive(Debug)]
pub struct ReaderService {
    config: ReaderConfig,
    broker: Arc<dyn Broker>,
    dispatcher: Arc<dyn DeliveryDispatcher>,
    events: Arc<dyn ReaderEventHandler>,
    clock: Arc<dyn Clock>,
    state: Mutex<ServiceState>,
    pump: tokio::sync::Mutex<Option<ReaderPump>>,
}

impl ReaderService {
    /// Creates a service that starts as primary.
    pub fn new(
        config: ReaderConfig,
        broker: Arc<dyn Broker>,
        dispatcher: Arc<dyn DeliveryDispatcher>,
        events: Arc<dyn ReaderEventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            broker,
            dispatcher,
            events,
            clock,
            state: Mutex::new(ServiceState {
                reader: None,
                role: ReplicaRole::Primary,
                running: None,
            }),
            pump: tokio::sync::Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reader created by `open`.
    pub fn reader(&self) -> Option<Arc<Reader>> {
        self.state().reader.clone()
    }

    /// Current role.
    pub fn role(&self) -> ReplicaRole {
        self.state().role
    }

    /// Whether `run` is currently executing.
    pub fn is_running(&self) -> bool {
        self.state().running.is_some()
    }
}

#[async_trait::async_trait]
impl Lifecycle for ReaderService {
    async fn open(&self, init_payload: &[u8]) -> Result<()> {
        let reader = Arc::new(Reader::from_payload(
            init_payload,
            self.config.clone(),
            self.events.clone(),
            self.clock.clone(),
        )?);
        let pump = ReaderPump::new(reader.clone(), self.broker.clone(), self.dispatcher.clone());

        let mut slot = self.pump.lock().await;
        if slot.is_some() {
            return Err(ReaderError::configuration("reader service is already open"));
        }
        *slot = Some(pump);
        drop(slot);

        info!(
            subscription = %reader.init().subscription_name,
            event_type = %reader.init().event_type,
            subscriber = %reader.init().subscriber_name,
            dead_letter = reader.init().dead_letter,
            "reader service opened"
        );
        self.state().reader = Some(reader);
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let run_token = {
            let mut state = self.state();
            if state.role != ReplicaRole::Primary {
                info!(role = ?state.role, "not primary, reader stays idle");
                return Ok(());
            }
            if state.running.is_some() {
                return Err(ReaderError::configuration("reader service is already running"));
            }
            let token = cancel.child_token();
            state.running = Some(token.clone());
            token
        };

        let mut slot = self.pump.lock().await;
        let Some(pump) = slot.as_mut() else {
            self.state().running = None;
            return Err(ReaderError::configuration("reader service is not open"));
        };

        let heartbeat = HeartbeatReporter::from_reader(pump.reader())
            .map(|reporter| tokio::spawn(reporter.run(run_token.clone())));

        pump.run(run_token.clone()).await;

        run_token.cancel();
        if let Some(handle) = heartbeat {
            if let Err(error) = handle.await {
                warn!(error = %error, "heartbeat task ended abnormally");
            }
        }
        drop(slot);

        self.state().running = None;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(token) = self.state().running.clone() {
            token.cancel();
        }

        let mut slot = self.pump.lock().await;
        if let Some(mut pump) = slot.take() {
            pump.shutdown().await;
        }
        drop(slot);

        info!("reader service closed");
        Ok(())
    }

    async fn change_role(&self, role: ReplicaRole) -> Result<()> {
        let mut state = self.state();
        let previous = std::mem::replace(&mut state.role, role);
        if role != ReplicaRole::Primary {
            if let Some(token) = state.running.as_ref() {
                token.cancel();
            }
        }
        drop(state);

        info!(previous = ?previous, role = ?role, "replica role changed");
        Ok(())
    }
}
