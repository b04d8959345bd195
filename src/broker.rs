//! The broker: one event loop owning the socket, the scheduler, the
//! connection table, the dispatcher, and the clock synchroniser.
//!
//! Everything runs on this loop. Module handlers, protocol transitions, and
//! dispatch all execute here one task at a time, so no handler ever observes
//! another handler mid-flight. The only thread-safe surface is
//! [`BrokerHandle`], which serialises through the scheduler mutex and a
//! command channel before work reaches the loop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::clock::ClockSynchronizer;
use crate::config::{Config, Timings};
use crate::connection::{ConnectionTable, SendDisposition};
use crate::dispatch::{Dispatcher, Handler, PreHandler};
use crate::message::Message;
use crate::peers::{PeerId, PeerList, PeerRecord, RemoteHost};
use crate::scheduler::{ModuleId, Scheduler, SchedulerError, Task, TimerHandle};
use crate::transport::{Action, Endpoint, TransportError};
use crate::wallclock;

/// Failures that can stop the broker from starting or running.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// The command channel closed while the loop was still running.
    #[error("broker command channel closed unexpectedly")]
    ChannelClosed,
}

enum Command {
    /// Nudge the loop so it re-reads deadlines and queues.
    Wake,
    Send { dest: PeerId, msg: Message },
    Kill(PeerId),
    Stop,
}

/// Thread-safe surface onto a running broker.
#[derive(Clone)]
pub struct BrokerHandle {
    local_id: PeerId,
    tx: mpsc::UnboundedSender<Command>,
    scheduler: Arc<Mutex<Scheduler>>,
}

impl BrokerHandle {
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Queues a message for `dest`; the loop stamps and transmits it.
    pub fn send(&self, dest: PeerId, msg: Message) {
        let _ = self.tx.send(Command::Send { dest, msg });
    }

    /// Appends a task to a module's ready queue from any thread.
    pub fn schedule(&self, module: impl Into<ModuleId>, task: Task) -> Result<(), SchedulerError> {
        lock(&self.scheduler).schedule_now(module, task, true)?;
        let _ = self.tx.send(Command::Wake);
        Ok(())
    }

    /// Allocates a deadline timer owned by `module`.
    pub fn allocate_timer(&self, module: impl Into<ModuleId>) -> Result<TimerHandle, SchedulerError> {
        lock(&self.scheduler).allocate_timer(module)
    }

    /// Arms a timer; `None` defers the firing to the end of the owning
    /// module's current phase.
    pub fn schedule_timer(
        &self,
        handle: TimerHandle,
        wait: Option<Duration>,
        task: Task,
    ) -> Result<(), SchedulerError> {
        lock(&self.scheduler).schedule_timer(handle, wait, task, Instant::now())?;
        let _ = self.tx.send(Command::Wake);
        Ok(())
    }

    pub fn cancel_timer(&self, handle: TimerHandle) {
        lock(&self.scheduler).cancel_timer(handle);
    }

    /// Time left in the active phase.
    pub fn time_remaining(&self) -> Duration {
        lock(&self.scheduler).time_remaining(Instant::now())
    }

    /// Asks the reliable channel to `peer` to restart its session, marking
    /// everything the peer holds from us as stale.
    pub fn request_kill(&self, peer: PeerId) {
        let _ = self.tx.send(Command::Kill(peer));
    }

    /// Stops the broker from any thread; safe to call repeatedly.
    pub fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }
}

pub struct Broker {
    endpoint: Endpoint,
    table: ConnectionTable,
    dispatcher: Dispatcher,
    scheduler: Arc<Mutex<Scheduler>>,
    clock: ClockSynchronizer,
    peers: PeerList,
    rx: mpsc::UnboundedReceiver<Command>,
    handle: BrokerHandle,
}

impl Broker {
    /// Binds the socket and wires the subsystems from configuration.
    pub async fn new(config: &Config, timings: &Timings) -> Result<Self, BrokerError> {
        let endpoint = Endpoint::bind(&config.listen_address, config.listen_port).await?;
        let local_id = config.local_id();

        let mut peers = PeerList::new();
        peers.insert(PeerRecord::new(
            local_id.clone(),
            RemoteHost {
                hostname: config.listen_address.clone(),
                port: config.listen_port,
            },
        ));
        let mut table = ConnectionTable::new(local_id.clone(), timings);
        for peer in &config.peers {
            peers.insert(PeerRecord::new(
                peer.clone(),
                RemoteHost { hostname: peer.host().to_string(), port: peer.port() },
            ));
            table.put_hostname(peer.clone(), peer.host().to_string(), peer.port());
        }

        let clock = ClockSynchronizer::new(
            local_id.clone(),
            Duration::from_millis(timings.CS_EXCHANGE_TIME),
        );

        let scheduler = Arc::new(Mutex::new(Scheduler::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = BrokerHandle {
            local_id,
            tx,
            scheduler: Arc::clone(&scheduler),
        };

        Ok(Self {
            endpoint,
            table,
            dispatcher: Dispatcher::new(),
            scheduler,
            clock,
            peers,
            rx,
            handle,
        })
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    pub fn local_id(&self) -> &PeerId {
        self.table.local_id()
    }

    /// Adds a module to the phase rotation.
    pub fn register_module(&mut self, module: impl Into<ModuleId>, duration: Duration) {
        lock(&self.scheduler).register(module, duration, Instant::now());
    }

    /// Installs a message handler for `(module, kind)`.
    pub fn register_handler(
        &mut self,
        module: impl Into<ModuleId>,
        kind: impl Into<String>,
        handler: Handler,
    ) {
        self.dispatcher.register(module, kind, handler);
    }

    /// Installs a pre-handler for a module.
    pub fn register_pre_handler(&mut self, module: impl Into<ModuleId>, pre: PreHandler) {
        self.dispatcher.register_pre_handler(module, pre);
    }

    /// Runs the event loop until `stop` is requested. Clean shutdown drains
    /// the connections and returns `Ok`.
    pub async fn run(mut self) -> Result<(), BrokerError> {
        info!("broker running as {}", self.handle.local_id());
        self.clock.start(Instant::now());
        let mut buf = Endpoint::recv_buffer();

        loop {
            let deadline = self.next_deadline();
            let sleep = match deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline))
                }
                // Nothing scheduled; sleep long, a command will wake us.
                None => tokio::time::sleep_until(tokio::time::Instant::from_std(
                    Instant::now() + IDLE_WAIT,
                )),
            };

            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(Command::Stop) => {
                            self.shutdown();
                            return Ok(());
                        }
                        Some(command) => self.on_command(command),
                        None => return Err(BrokerError::ChannelClosed),
                    }
                }
                received = self.endpoint.recv(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.on_datagram(&buf[..len], from),
                        Err(e) => warn!("receive failed: {}", e),
                    }
                }
                _ = sleep => {}
            }

            self.process_deadlines();
            self.drain_tasks();
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Wake | Command::Stop => {}
            Command::Send { dest, msg } => self.send_message(&dest, msg),
            Command::Kill(peer) => {
                if let Some(connection) = self.table.connection_mut(&peer) {
                    connection.request_kill();
                }
            }
        }
    }

    fn send_message(&mut self, dest: &PeerId, msg: Message) {
        match self.table.send(dest, msg, Instant::now()) {
            Ok(SendDisposition::SelfDeliver(delivered)) => self.deliver(delivered),
            Ok(SendDisposition::Wire(peer, actions)) => self.perform(&peer, actions),
            Err(e) => warn!("cannot send to {}: {}", dest, e),
        }
    }

    fn on_datagram(&mut self, bytes: &[u8], from: std::net::SocketAddr) {
        let msg = match Message::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping undecodable datagram from {}: {}", from, e);
                return;
            }
        };
        let source = msg.source_peer_id.clone();
        let actions = self.table.receive(msg, from, Instant::now());
        if let Some(source) = source {
            self.perform(&source, actions);
        }
    }

    /// Carries out engine actions: writes go to the socket (subject to the
    /// peer's reliability percent), deliveries go to the clock or the
    /// dispatcher.
    fn perform(&mut self, peer: &PeerId, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Write(msg) => self.write(peer, msg),
                Action::Deliver(msg) => self.deliver(msg),
            }
        }
    }

    fn write(&mut self, peer: &PeerId, msg: Message) {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("refusing to transmit {}: {}", msg.handler_key, e);
                return;
            }
        };
        let (addr, reliability) = match self.table.connection(peer) {
            Some(connection) => match connection.addr() {
                Some(addr) => (addr, connection.reliability()),
                None => {
                    warn!("no address for {}, dropping {}", peer, msg.handler_key);
                    return;
                }
            },
            None => return,
        };
        if let Err(e) = self.endpoint.send(addr, &bytes, reliability) {
            // A hard socket fault stops this connection; the peer will be
            // resynchronised on next contact.
            error!("transport fault towards {}: {}", peer, e);
            self.table.stop(peer);
        }
    }

    /// Routes an accepted message: clock traffic is consumed here, all else
    /// goes through the dispatcher onto the scheduler.
    fn deliver(&mut self, msg: Message) {
        if msg.module() == "clk" {
            self.deliver_clock(msg);
            return;
        }
        let mut scheduler = lock(&self.scheduler);
        self.dispatcher.handle(msg, &mut scheduler);
    }

    fn deliver_clock(&mut self, msg: Message) {
        match msg.kind() {
            "exchange" => {
                let Some(source) = msg.source_peer_id.clone() else { return };
                if let Some(response) = self.clock.on_challenge(&msg) {
                    self.send_message(&source, response);
                }
            }
            "exchange_response" => {
                let Some(source) = msg.source_peer_id.clone() else { return };
                self.clock.on_response(&msg, &source, wallclock::unix_micros());
            }
            other => info!("ignoring unknown clock message kind {:?}", other),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let scheduler = lock(&self.scheduler).next_deadline();
        [scheduler, self.table.next_deadline(), self.clock.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Fires everything that has come due: scheduler phases and timers,
    /// protocol resends, and the clock exchange.
    fn process_deadlines(&mut self) {
        let now = Instant::now();

        let skewed_wall = skewed_wall_millis(self.clock.skew_millis());
        let changes = lock(&self.scheduler).poll(now, skewed_wall);
        for change in changes {
            self.table.change_phase(change.new_round);
        }

        for (peer, actions) in self.table.on_timer(now) {
            self.perform(&peer, actions);
        }

        if self.clock.next_deadline().is_some_and(|d| d <= now) {
            let challenges = self.clock.on_timer(now, wallclock::unix_micros(), &self.peers);
            for (peer, msg) in challenges {
                self.send_message(&peer, msg);
            }
        }
    }

    /// Runs ready tasks to completion, one at a time. A panicking handler is
    /// logged and the loop continues; only configuration errors at startup
    /// and a stop request terminate the broker.
    fn drain_tasks(&mut self) {
        loop {
            let next = lock(&self.scheduler).take_task();
            let Some((task, outcome)) = next else { break };
            let result = catch_unwind(AssertUnwindSafe(|| task(outcome)));
            if result.is_err() {
                error!("handler task panicked; continuing");
            }
            lock(&self.scheduler).task_finished();
        }
    }

    fn shutdown(&mut self) {
        info!("broker shutting down");
        lock(&self.scheduler).stop();
        self.clock.stop();
        self.table.stop_all();
    }
}

/// How long the loop sleeps when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

fn lock(scheduler: &Arc<Mutex<Scheduler>>) -> MutexGuard<'_, Scheduler> {
    scheduler.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The wall clock shifted by the estimated skew, clamped at zero.
fn skewed_wall_millis(skew_millis: i64) -> u64 {
    let wall = wallclock::unix_millis() as i64 + skew_millis;
    wall.max(0) as u64
}
