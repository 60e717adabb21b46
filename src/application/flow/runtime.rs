use super::config::FlowConfig;
use super::events::{Command, FlowEvent, FlowNotice, SystemEvent, TimerKind};
use super::machine::{Effect, FlowMachine, MachineEnv, ProviderCall};
use super::state::{FlowSnapshot, FlowState};
use crate::application::fallback::state::FallbackConfig;
use crate::domain::ports::{SharedGateway, SharedRegistry};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

const NOTICE_CAPACITY: usize = 32;

/// Collaborators shared by every flow of an engine.
#[derive(Clone)]
pub struct FlowDeps {
    pub gateway: SharedGateway,
    pub registry: SharedRegistry,
    pub config: FlowConfig,
    pub fallback: FallbackConfig,
}

/// Wall clock advanced by the tokio clock, so paused test time drives both.
#[derive(Debug, Clone, Copy)]
struct Clock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.mono.elapsed()).unwrap_or(chrono::Duration::zero());
        self.wall + elapsed
    }
}

/// Handle to a running flow actor.
///
/// Clones address the same flow. The actor stops on [`FlowHandle::shutdown`] or
/// as soon as every handle is dropped. Provider calls and timers still in flight
/// at that point are abandoned and their results discarded.
#[derive(Clone)]
pub struct FlowHandle {
    flow_id: String,
    events: mpsc::UnboundedSender<FlowEvent>,
    snapshots: watch::Receiver<FlowSnapshot>,
    notices: broadcast::Sender<FlowNotice>,
}

impl FlowHandle {
    pub fn spawn(deps: FlowDeps) -> Self {
        Self::spawn_with_id(Uuid::new_v4().to_string(), deps)
    }

    pub fn spawn_with_id(flow_id: impl Into<String>, deps: FlowDeps) -> Self {
        let flow_id = flow_id.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let clock = Clock::new();
        let machine = FlowMachine::new(flow_id.clone());
        let (snapshots_tx, snapshots) = watch::channel(machine.snapshot(clock.now()));

        let actor = FlowActor {
            machine,
            deps,
            clock,
            inbox: events_rx,
            outbox: events_tx.downgrade(),
            backlog: VecDeque::new(),
            timer: None,
            snapshots: snapshots_tx,
            notices: notices.clone(),
        };
        let span = info_span!("flow", flow_id = %flow_id);
        tokio::spawn(actor.run().instrument(span));

        Self {
            flow_id,
            events: events_tx,
            snapshots,
            notices,
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn send(&self, command: Command) -> Result<()> {
        self.events
            .send(FlowEvent::Command(command))
            .map_err(|_| PaymentError::Shutdown)
    }

    /// Delivers a redirect return, webhook or status notification.
    pub fn notify(&self, event: SystemEvent) -> Result<()> {
        self.events
            .send(FlowEvent::System(event))
            .map_err(|_| PaymentError::Shutdown)
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FlowSnapshot> {
        self.snapshots.clone()
    }

    /// Completion and failure notices. Only notices sent after this call are received.
    pub fn notices(&self) -> broadcast::Receiver<FlowNotice> {
        self.notices.subscribe()
    }

    pub async fn wait_for(&self, mut predicate: impl FnMut(&FlowSnapshot) -> bool) -> Result<FlowSnapshot> {
        let mut rx = self.subscribe();
        let snapshot = rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| PaymentError::Shutdown)?
            .clone();
        Ok(snapshot)
    }

    pub async fn wait_for_state(&self, state: FlowState) -> Result<FlowSnapshot> {
        self.wait_for(|snapshot| snapshot.state == state).await
    }

    pub fn shutdown(&self) {
        let _ = self.events.send(FlowEvent::Shutdown);
    }
}

struct FlowActor {
    machine: FlowMachine,
    deps: FlowDeps,
    clock: Clock,
    inbox: mpsc::UnboundedReceiver<FlowEvent>,
    outbox: mpsc::WeakUnboundedSender<FlowEvent>,
    /// Replayed events, processed before the inbox.
    backlog: VecDeque<FlowEvent>,
    timer: Option<JoinHandle<()>>,
    snapshots: watch::Sender<FlowSnapshot>,
    notices: broadcast::Sender<FlowNotice>,
}

impl FlowActor {
    async fn run(mut self) {
        debug!("flow actor started");
        loop {
            let event = match self.backlog.pop_front() {
                Some(event) => event,
                None => match self.inbox.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };
            if matches!(event, FlowEvent::Shutdown) {
                break;
            }

            let now = self.clock.now();
            let effects = {
                let env = MachineEnv {
                    config: &self.deps.config,
                    fallback: &self.deps.fallback,
                    gateway: self.deps.gateway.as_ref(),
                    registry: self.deps.registry.as_ref(),
                    now,
                };
                self.machine.handle(event, &env)
            };
            for effect in effects {
                self.apply(effect);
            }
            self.snapshots.send_replace(self.machine.snapshot(now));
        }
        self.cancel_timer();
        debug!(state = ?self.machine.state(), "flow actor stopped");
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Invoke { token, call } => self.invoke(token, call),
            Effect::Schedule { token, kind, delay } => self.schedule(token, kind, delay),
            Effect::CancelTimer => self.cancel_timer(),
            Effect::Notify(notice) => {
                // No subscribers is fine.
                let _ = self.notices.send(notice);
            }
            Effect::Replay(events) => {
                for event in events.into_iter().rev() {
                    self.backlog.push_front(FlowEvent::System(event));
                }
            }
        }
    }

    fn invoke(&self, token: u64, call: ProviderCall) {
        let gateway = self.deps.gateway.clone();
        let outbox = self.outbox.clone();
        let operation = call.operation();
        tokio::spawn(
            async move {
                let result = call.execute(gateway.as_ref()).await;
                if let Some(outbox) = outbox.upgrade() {
                    let _ = outbox.send(FlowEvent::Settled {
                        token,
                        operation,
                        result,
                    });
                }
            }
            .in_current_span(),
        );
    }

    fn schedule(&mut self, token: u64, kind: TimerKind, delay: Duration) {
        self.cancel_timer();
        let outbox = self.outbox.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(outbox) = outbox.upgrade() {
                let _ = outbox.send(FlowEvent::TimerFired { token, kind });
            }
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
