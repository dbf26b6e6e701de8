//! Handler fan-out semantics: ordering, tombstoning, and the visibility
//! rule for registrations made during dispatch.

use std::sync::{Arc, Mutex};

use dissect::{Decoder, EventId, Kernel, Module, ModuleId, ParamId, Payload, Property, Registrar};

/// Test module firing two events per packet, in declaration order.
#[derive(Default)]
struct Pulse {
    p_len: ParamId,
    ev_first: EventId,
    ev_second: EventId,
}

impl Module for Pulse {
    fn name(&self) -> &'static str {
        "pulse"
    }

    fn declare(&mut self, reg: &mut Registrar<'_>) {
        self.p_len = reg.define_param("len");
        self.ev_first = reg.define_event("first");
        self.ev_second = reg.define_event("second");
    }

    fn decode<'p>(
        &mut self,
        payload: &mut Payload<'p>,
        prop: &mut Property<'p>,
    ) -> Option<ModuleId> {
        prop.retain_value(self.p_len)
            .cpy(&[payload.len() as u8], dissect::Endian::Little);
        prop.push_event(self.ev_first);
        prop.push_event(self.ev_second);
        None
    }
}

fn pulse_kernel() -> Kernel {
    let mut dec = Decoder::new();
    dec.register(Pulse::default()).unwrap();
    Kernel::with_decoder(dec).unwrap()
}

/// Feed `n` empty packets and run the consumer loop on this thread.
fn pump(kernel: &mut Kernel, n: usize) {
    let ch = kernel.channel();
    for _ in 0..n {
        let mut pkt = ch.retain();
        pkt.fill(&[], 0, 0);
        ch.push(pkt);
    }
    ch.close();
    kernel.run();
}

type Log = Arc<Mutex<Vec<&'static str>>>;

fn recorder(log: &Log, tag: &'static str) -> impl FnMut(&Property<'_>) + Send + 'static {
    let log = Arc::clone(log);
    move |_| log.lock().unwrap().push(tag)
}

#[test]
fn test_dispatch_order_is_event_then_registration() {
    let mut kernel = pulse_kernel();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    kernel.on("first", recorder(&log, "first/1")).unwrap();
    kernel.on("second", recorder(&log, "second/1")).unwrap();
    kernel.on("first", recorder(&log, "first/2")).unwrap();

    pump(&mut kernel, 1);

    // Events fire in push order; within an event, registration order.
    assert_eq!(*log.lock().unwrap(), vec!["first/1", "first/2", "second/1"]);
}

#[test]
fn test_register_then_clear_restores_dispatch() {
    let mut kernel = pulse_kernel();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    kernel.on("first", recorder(&log, "keep")).unwrap();
    let id = kernel.on("first", recorder(&log, "gone")).unwrap();
    assert!(kernel.clear(id));

    pump(&mut kernel, 2);

    assert_eq!(*log.lock().unwrap(), vec!["keep", "keep"]);
}

#[test]
fn test_handler_registered_during_dispatch_waits_for_next_event() {
    let mut kernel = pulse_kernel();
    let control = kernel.control();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    // While handling "first", register a handler for both events. The
    // "first" of the current packet is already being dispatched, so the
    // new handlers must only see "second" onward.
    {
        let log = Arc::clone(&log);
        let control = control.clone();
        let mut done = false;
        kernel
            .on("first", move |_| {
                log.lock().unwrap().push("trigger");
                if !done {
                    done = true;
                    control.on("first", recorder(&log, "late-first")).unwrap();
                    control.on("second", recorder(&log, "late-second")).unwrap();
                }
            })
            .unwrap();
    }

    pump(&mut kernel, 2);

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "trigger",       // packet 1, first
            "late-second",   // packet 1, second: visible right after the event boundary
            "trigger",       // packet 2, first
            "late-first",    // packet 2, first: registered handler now live
            "late-second",   // packet 2, second
        ]
    );
}

#[test]
fn test_clear_during_dispatch_takes_effect_after_event() {
    let mut kernel = pulse_kernel();
    let control = kernel.control();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let victim = kernel.on("first", recorder(&log, "victim")).unwrap();
    {
        let log = Arc::clone(&log);
        let control = control.clone();
        kernel
            .on("first", move |_| {
                log.lock().unwrap().push("assassin");
                control.clear(victim);
            })
            .unwrap();
    }

    pump(&mut kernel, 2);

    // The victim was registered before the assassin, so it runs once in
    // packet 1; by packet 2 it is tombstoned.
    assert_eq!(*log.lock().unwrap(), vec!["victim", "assassin", "assassin"]);
}

#[test]
fn test_param_visible_to_handlers() {
    let mut kernel = pulse_kernel();
    let p_len = kernel.decoder().param_id("pulse.len").unwrap();
    let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        kernel.on("first", move |prop| {
            seen.lock().unwrap().push(prop.value(p_len).unwrap().u8().unwrap());
        });
    }

    let ch = kernel.channel();
    for len in [0usize, 3, 7] {
        let mut pkt = ch.retain();
        pkt.fill(&vec![0xaa; len], len, 0);
        ch.push(pkt);
    }
    ch.close();
    kernel.run();

    assert_eq!(*seen.lock().unwrap(), vec![0, 3, 7]);
}

#[test]
fn test_counters_track_pulls() {
    let mut kernel = pulse_kernel();
    let ch = kernel.channel();
    for len in [4usize, 6] {
        let mut pkt = ch.retain();
        pkt.fill(&vec![0u8; len], len, 0);
        ch.push(pkt);
    }
    ch.close();
    kernel.run();

    assert_eq!(kernel.recv_pkt(), 2);
    assert_eq!(kernel.recv_size(), 10);
}
