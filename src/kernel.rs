//! Consumer loop and event-to-handler fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use compact_str::CompactString;
use tracing::debug;

use crate::channel::Channel;
use crate::decoder::{Decoder, EventId};
use crate::error::RegistrationError;
use crate::packet::{Packet, Payload};
use crate::property::Property;
use crate::protocol::{EthernetModule, Ipv4Module, TcpModule, UdpModule};

/// Handler callback. Receives the read-only property record after a packet
/// fired its event; must not block and must not retain references past
/// return (the lifetime makes the latter impossible to get wrong).
pub type Callback = Box<dyn FnMut(&Property<'_>) + Send>;

/// Identifies a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Entry {
    id: HandlerId,
    cb: Callback,
}

enum Command {
    On {
        id: HandlerId,
        event: EventId,
        cb: Callback,
    },
    Clear {
        id: HandlerId,
    },
}

/// State shared between the kernel and its control handles.
struct ControlShared {
    events: HashMap<CompactString, EventId>,
    next_id: AtomicU64,
    queue: Mutex<Vec<Command>>,
}

/// Cloneable handle for registering and clearing handlers while the kernel
/// runs — including from inside a handler callback.
///
/// Changes submitted through a control handle are applied between events:
/// a handler registered during dispatch sees the next event at the
/// earliest, never the one being dispatched.
#[derive(Clone)]
pub struct KernelControl {
    shared: Arc<ControlShared>,
}

impl KernelControl {
    /// Register a callback for a named event. Returns `None` when the
    /// event name is unknown.
    pub fn on<F>(&self, event: &str, cb: F) -> Option<HandlerId>
    where
        F: FnMut(&Property<'_>) + Send + 'static,
    {
        let eid = *self.shared.events.get(event)?;
        let id = HandlerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.shared.queue.lock().unwrap().push(Command::On {
            id,
            event: eid,
            cb: Box::new(cb),
        });
        Some(id)
    }

    /// Request removal of a handler; takes effect before the next event.
    pub fn clear(&self, id: HandlerId) {
        self.shared
            .queue
            .lock()
            .unwrap()
            .push(Command::Clear { id });
    }
}

struct Counters {
    recv_pkt: AtomicU64,
    recv_size: AtomicU64,
}

/// Owns the packet channel and the decoder; runs the consumer loop.
///
/// Per packet: pull from the channel, decode through the module chain,
/// then fire each event in push order to its handlers in registration
/// order, and recycle the packet. The loop ends when the producer closes
/// the channel.
pub struct Kernel {
    channel: Arc<Channel<Packet>>,
    decoder: Decoder,
    /// event id → entries in registration order; cleared slots are
    /// tombstoned in place and skipped.
    handlers: Vec<Vec<Option<Entry>>>,
    index: HashMap<HandlerId, (EventId, usize)>,
    control: Arc<ControlShared>,
    counters: Arc<Counters>,
}

impl Kernel {
    /// Kernel over the default module chain: Ethernet → IPv4 → {TCP, UDP}.
    pub fn new() -> Result<Self, RegistrationError> {
        let mut decoder = Decoder::new();
        decoder.register(EthernetModule::default())?;
        decoder.register(Ipv4Module::default())?;
        decoder.register(UdpModule::default())?;
        decoder.register(TcpModule::new())?;
        Self::with_decoder(decoder)
    }

    /// Kernel over a custom module chain. Runs `setup()` if the decoder
    /// has not been set up yet.
    pub fn with_decoder(mut decoder: Decoder) -> Result<Self, RegistrationError> {
        if !decoder.is_ready() {
            decoder.setup()?;
        }
        let events = decoder
            .events()
            .map(|def| (CompactString::from(def.name()), def.id()))
            .collect();
        let handlers = (0..decoder.event_count()).map(|_| Vec::new()).collect();
        Ok(Self {
            channel: Arc::new(Channel::new()),
            decoder,
            handlers,
            index: HashMap::new(),
            control: Arc::new(ControlShared {
                events,
                next_id: AtomicU64::new(0),
                queue: Mutex::new(Vec::new()),
            }),
            counters: Arc::new(Counters {
                recv_pkt: AtomicU64::new(0),
                recv_size: AtomicU64::new(0),
            }),
        })
    }

    /// The packet hand-off channel. The capture producer clones this,
    /// `retain`s packets, fills them, and `push`es; `close()` ends the run
    /// loop.
    pub fn channel(&self) -> Arc<Channel<Packet>> {
        Arc::clone(&self.channel)
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Control handle usable from other threads and from inside handlers.
    pub fn control(&self) -> KernelControl {
        KernelControl {
            shared: Arc::clone(&self.control),
        }
    }

    /// Register a callback for a named event. Returns `None` when the
    /// event name is unknown.
    pub fn on<F>(&mut self, event: &str, cb: F) -> Option<HandlerId>
    where
        F: FnMut(&Property<'_>) + Send + 'static,
    {
        let eid = *self.control.events.get(event)?;
        let id = HandlerId(self.control.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.attach(id, eid, Box::new(cb));
        Some(id)
    }

    /// Unregister a handler. Returns false when the id is not present.
    pub fn clear(&mut self, id: HandlerId) -> bool {
        match self.index.remove(&id) {
            Some((eid, at)) => {
                let slot = &mut self.handlers[eid.index()][at];
                debug_assert!(slot.as_ref().map_or(true, |entry| entry.id == id));
                *slot = None;
                true
            }
            None => false,
        }
    }

    /// Packets pulled so far.
    pub fn recv_pkt(&self) -> u64 {
        self.counters.recv_pkt.load(Ordering::Relaxed)
    }

    /// Captured bytes pulled so far.
    pub fn recv_size(&self) -> u64 {
        self.counters.recv_size.load(Ordering::Relaxed)
    }

    /// Consumer loop. Exits when the channel closes and drains.
    pub fn run(&mut self) {
        while let Some(pkt) = self.channel.pull() {
            self.counters.recv_pkt.fetch_add(1, Ordering::Relaxed);
            self.counters
                .recv_size
                .fetch_add(pkt.cap_len() as u64, Ordering::Relaxed);

            {
                let mut payload = Payload::new(&pkt);
                let mut prop = Property::new(&pkt, self.decoder.param_count());
                self.decoder.decode(&mut payload, &mut prop);

                for i in 0..prop.event_count() {
                    let eid = prop.event(i);
                    for entry in self.handlers[eid.index()].iter_mut().flatten() {
                        (entry.cb)(&prop);
                    }
                    self.apply_commands();
                }
            }
            self.apply_commands();
            self.channel.release(pkt);
        }
        debug!(
            packets = self.recv_pkt(),
            bytes = self.recv_size(),
            "channel closed, kernel loop done"
        );
    }

    /// Spawn the consumer thread. The producer keeps feeding the channel;
    /// closing it ends the run and [`RunningKernel::join`] hands the
    /// kernel back.
    pub fn start(self) -> RunningKernel {
        let channel = self.channel();
        let control = self.control();
        let counters = Arc::clone(&self.counters);
        let handle = thread::spawn(move || {
            let mut kernel = self;
            kernel.run();
            kernel
        });
        RunningKernel {
            channel,
            control,
            counters,
            handle,
        }
    }

    fn attach(&mut self, id: HandlerId, eid: EventId, cb: Callback) {
        let list = &mut self.handlers[eid.index()];
        self.index.insert(id, (eid, list.len()));
        list.push(Some(Entry { id, cb }));
    }

    /// Apply queued control commands. Runs between events so changes made
    /// during dispatch never affect the event being dispatched.
    fn apply_commands(&mut self) {
        let commands: Vec<Command> = {
            let mut queue = self.control.queue.lock().unwrap();
            queue.drain(..).collect()
        };
        for command in commands {
            match command {
                Command::On { id, event, cb } => self.attach(id, event, cb),
                Command::Clear { id } => {
                    self.clear(id);
                }
            }
        }
    }
}

/// A kernel running on its own thread.
pub struct RunningKernel {
    channel: Arc<Channel<Packet>>,
    control: KernelControl,
    counters: Arc<Counters>,
    handle: JoinHandle<Kernel>,
}

impl RunningKernel {
    pub fn channel(&self) -> Arc<Channel<Packet>> {
        Arc::clone(&self.channel)
    }

    pub fn control(&self) -> KernelControl {
        self.control.clone()
    }

    pub fn recv_pkt(&self) -> u64 {
        self.counters.recv_pkt.load(Ordering::Relaxed)
    }

    pub fn recv_size(&self) -> u64 {
        self.counters.recv_size.load(Ordering::Relaxed)
    }

    /// Wait for the kernel to finish (the producer must have closed the
    /// channel, or must do so concurrently).
    pub fn join(self) -> Kernel {
        self.handle.join().expect("kernel thread panicked")
    }

    /// Close the channel and wait for the kernel to drain and finish.
    pub fn stop(self) -> Kernel {
        self.channel.close();
        self.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_unknown_event_is_none() {
        let mut kernel = Kernel::new().unwrap();
        assert!(kernel.on("no_such_event", |_| {}).is_none());
        assert!(kernel.on("new_session", |_| {}).is_some());
    }

    #[test]
    fn test_clear_unknown_handler_is_false() {
        let mut kernel = Kernel::new().unwrap();
        let id = kernel.on("new_session", |_| {}).unwrap();
        assert!(kernel.clear(id));
        assert!(!kernel.clear(id));
    }

    #[test]
    fn test_handler_ids_are_unique() {
        let mut kernel = Kernel::new().unwrap();
        let a = kernel.on("new_session", |_| {}).unwrap();
        let b = kernel.on("established", |_| {}).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_control_on_unknown_event_is_none() {
        let kernel = Kernel::new().unwrap();
        let control = kernel.control();
        assert!(control.on("no_such_event", |_| {}).is_none());
        assert!(control.on("closed", |_| {}).is_some());
    }
}
