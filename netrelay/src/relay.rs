use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use proto::{
    AddressMapper, CodecFactory, Connector, ControlMessage, DataMessage, Engine, Entry, Error,
    PacketSink, RelayConfig, Tunnel, Wake,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::SchedulerConfig,
    mutex::MutexGuard,
    scheduler::{run_delivery, run_reclaimer, run_transmitter, Waker},
    table::{ConnTable, EntryRef},
};

/// A running relay
///
/// Owns the connection table and the three background threads that serve it: the tunnel
/// transmitter, the local-delivery scheduler and the reclaimer. Captured frames are fed in
/// through [`handle_frame`](Self::handle_frame); events from remote proxies through
/// [`handle_control`](Self::handle_control) and [`handle_data`](Self::handle_data).
///
/// Dropping the relay stops and joins its threads.
pub struct Relay {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Start a relay
    ///
    /// Fails only if a scheduler thread cannot be spawned.
    pub fn new(
        config: Arc<RelayConfig>,
        scheduler: SchedulerConfig,
        sink: Arc<dyn PacketSink>,
        mapper: Arc<dyn AddressMapper>,
        connector: Arc<dyn Connector>,
        codecs: Arc<dyn CodecFactory>,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            engine: Engine::new(config, sink, mapper, connector, codecs),
            table: ConnTable::new(),
            config: scheduler,
            stop: AtomicBool::new(false),
            transmitter: Waker::default(),
            delivery: Waker::default(),
            reclaimer: Waker::default(),
        });

        let mut relay = Self {
            shared,
            threads: Vec::with_capacity(3),
        };
        let runners: [(&str, fn(Arc<Shared>)); 3] = [
            ("netrelay-transmit", run_transmitter),
            ("netrelay-deliver", run_delivery),
            ("netrelay-reclaim", run_reclaimer),
        ];
        for (name, run) in runners {
            let shared = relay.shared.clone();
            // On failure, dropping `relay` stops the threads spawned so far
            let handle = thread::Builder::new()
                .name(name.into())
                .spawn(move || run(shared))?;
            relay.threads.push(handle);
        }
        info!("relay started");
        Ok(relay)
    }

    /// Process a frame captured from the host
    ///
    /// Frames that are not IPv4/TCP, or are malformed, are dropped.
    pub fn handle_frame(&self, frame: &[u8]) -> Result<(), Error> {
        let packet = match self.shared.engine.parse_frame(frame) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("dropping frame: {}", e);
                return Ok(());
            }
        };
        let now = Instant::now();
        let engine = &self.shared.engine;
        let (id, result) = self.shared.table.with_entry(
            engine,
            packet.source,
            packet.destination,
            now,
            |entry| (entry.id(), engine.handle_host_packet(entry, &packet, now)),
        )?;
        self.shared.finish(id, "host packet", result)
    }

    /// Process a control message that arrived on `tunnel`
    ///
    /// The ids in `message` are the sender's view: its `local_id` is our remote id and its
    /// `remote_id` is ours.
    pub fn handle_control(
        &self,
        tunnel: &Arc<dyn Tunnel>,
        message: &ControlMessage,
    ) -> Result<(), Error> {
        let now = Instant::now();
        let engine = &self.shared.engine;
        match *message {
            ControlMessage::Open {
                local_id: remote_id,
                source,
                destination,
                compression,
            } => {
                let opened = self
                    .shared
                    .table
                    .with_entry(engine, destination, source, now, |entry| {
                        let result =
                            engine.open_to_host(entry, tunnel.clone(), remote_id, compression, now);
                        (entry.id(), result)
                    });
                match opened {
                    Ok((id, result)) => self.shared.finish(id, "open", result),
                    Err(e) => {
                        let reset = ControlMessage::Reset {
                            local_id: 0,
                            remote_id,
                        };
                        if let Err(reset_err) = tunnel.send_control(&reset) {
                            debug!(remote_id, "refusing open: {}", reset_err);
                        }
                        Err(e)
                    }
                }
            }
            ControlMessage::Opened {
                local_id: remote_id,
                remote_id: id,
                compression,
            } => {
                let slot = self.shared.lookup(id)?;
                let mut entry = self.shared.claimed(&slot, id, None)?;
                let result = engine.confirm_opened(&mut entry, remote_id, compression, now);
                self.shared.finish(id, "opened", result)
            }
            ControlMessage::Close {
                local_id: remote_id,
                remote_id: id,
            } => {
                let slot = self.shared.lookup(id)?;
                let mut entry = self.shared.claimed(&slot, id, Some(remote_id))?;
                let result = engine.close_to_host(&mut entry, now);
                self.shared.finish(id, "close", result)
            }
            ControlMessage::Reset {
                local_id: remote_id,
                remote_id: id,
            } => {
                let slot = self.shared.lookup(id)?;
                let mut entry = self.shared.claimed(&slot, id, Some(remote_id))?;
                let result = engine.reset_to_host(&mut entry, now).map(|()| Wake::NONE);
                self.shared.finish(id, "reset", result)
            }
        }
    }

    /// Process host data from a remote proxy
    pub fn handle_data(&self, message: &DataMessage<'_>) -> Result<(), Error> {
        let now = Instant::now();
        let slot = self.shared.lookup(message.remote_id)?;
        let mut entry = self
            .shared
            .claimed(&slot, message.remote_id, Some(message.local_id))?;
        let result = self
            .shared
            .engine
            .data_to_host(&mut entry, message.data, message.flags, now);
        self.shared.finish(message.remote_id, "data", result)
    }

    /// Number of slots currently allocated in the connection table
    pub fn table_len(&self) -> usize {
        self.shared.table.len()
    }

    /// Stop the background threads and wait for them to exit
    ///
    /// Connections are left as they are; the relay cannot be restarted.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.shared.stop.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            // Wake everything each time, a notification can be missed
            self.shared.transmitter.wake();
            self.shared.delivery.wake();
            self.shared.reclaimer.wake();
            if handle.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
        info!("relay stopped");
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("engine", &self.shared.engine)
            .field("config", &self.shared.config)
            .field("threads", &self.threads.len())
            .finish_non_exhaustive()
    }
}

/// State shared by the relay handle and its threads
pub(crate) struct Shared {
    pub(crate) engine: Engine,
    pub(crate) table: ConnTable,
    pub(crate) config: SchedulerConfig,
    pub(crate) stop: AtomicBool,
    pub(crate) transmitter: Waker,
    pub(crate) delivery: Waker,
    pub(crate) reclaimer: Waker,
}

impl Shared {
    fn lookup(&self, id: u16) -> Result<EntryRef, Error> {
        self.table.get(id).ok_or(Error::UnknownConnection)
    }

    /// Lock the entry behind `slot` if it still describes connection `id`
    ///
    /// `remote_id` is checked against the entry once the peer has told us its id.
    fn claimed<'a>(
        &self,
        slot: &'a EntryRef,
        id: u16,
        remote_id: Option<u16>,
    ) -> Result<MutexGuard<'a, Entry>, Error> {
        let entry = slot.lock("tunnel event");
        let stale = entry.is_unused()
            || entry.id() != id
            || matches!(remote_id, Some(r) if entry.remote_id() != 0 && entry.remote_id() != r);
        if stale {
            debug!(id, ?remote_id, "event for stale connection");
            return Err(Error::UnknownConnection);
        }
        Ok(entry)
    }

    /// Wake the schedulers an event asked for and log its failure
    fn finish(&self, id: u16, event: &str, result: Result<Wake, Error>) -> Result<(), Error> {
        match result {
            Ok(wake) => {
                if wake.host {
                    self.delivery.wake();
                }
                if wake.tunnel {
                    self.transmitter.wake();
                }
                Ok(())
            }
            Err(e) => {
                self.report(id, event, &e);
                Err(e)
            }
        }
    }

    /// Log an engine error at a level matching its cause
    pub(crate) fn report(&self, id: u16, context: &str, error: &Error) {
        match error {
            Error::Inject(_) | Error::Tunnel(_) | Error::Codec(_) => {
                error!(id, "{}: {}", context, error)
            }
            Error::Inconsistent { .. } | Error::InvalidState(_) | Error::PacketTooLarge(_) => {
                warn!(id, "{}: {}", context, error)
            }
            _ => debug!(id, "{}: {}", context, error),
        }
    }
}
