//! Module registry and the decode walk.
//!
//! Protocol modules register once, in chain order, and declare their
//! parameters and events against the decoder's global tables. After
//! [`setup`](Decoder::setup) resolves cross-module references and rejects
//! cyclic chains, [`decode`](Decoder::decode) walks a packet from the root
//! module downward until some module returns `None`.

use std::collections::HashMap;

use compact_str::CompactString;
use tracing::warn;

use crate::error::RegistrationError;
use crate::packet::Payload;
use crate::property::Property;

/// Identifies a registered module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ModuleId(usize);

/// Identifies a declared parameter in the decoder's global table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ParamId(usize);

impl ParamId {
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// Identifies a declared event in the decoder's global table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventId(usize);

impl EventId {
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// Immutable descriptor for a declared parameter.
#[derive(Debug, Clone)]
pub struct ParamDef {
    id: ParamId,
    name: CompactString,
}

impl ParamDef {
    pub fn id(&self) -> ParamId {
        self.id
    }

    /// Qualified name, e.g. `tcp.src_port`.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Immutable descriptor for a declared event.
#[derive(Debug, Clone)]
pub struct EventDef {
    id: EventId,
    name: CompactString,
}

impl EventDef {
    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A protocol decoder in the module chain.
///
/// Lifecycle: `declare` runs once at registration, `setup` once after all
/// modules are registered, then `decode` once per packet reaching this
/// layer. `decode` must not panic on hostile input — a short or malformed
/// header is reported by returning `None`, which ends the walk for this
/// packet.
pub trait Module: Send {
    /// Unique lowercase module name, e.g. `"tcp"`. Parameters declared by
    /// the module are namespaced under it.
    fn name(&self) -> &'static str;

    /// Declare parameters and events; store the returned ids.
    fn declare(&mut self, reg: &mut Registrar<'_>);

    /// Resolve references to other modules. Runs after every module is
    /// registered.
    fn setup(&mut self, _res: &Resolver<'_>) -> Result<(), RegistrationError> {
        Ok(())
    }

    /// Names of modules this one may hand off to, for the setup-time
    /// cycle check.
    fn children(&self) -> &[&'static str] {
        &[]
    }

    /// Dissect one layer: annotate the property, advance the payload, and
    /// return the next module — `None` terminates the walk.
    fn decode<'p>(
        &mut self,
        payload: &mut Payload<'p>,
        prop: &mut Property<'p>,
    ) -> Option<ModuleId>;
}

/// Registration-time context handed to [`Module::declare`].
pub struct Registrar<'a> {
    module: &'static str,
    params: &'a mut Vec<ParamDef>,
    events: &'a mut Vec<EventDef>,
    param_index: &'a mut HashMap<CompactString, ParamId>,
    event_index: &'a mut HashMap<CompactString, EventId>,
    error: &'a mut Option<RegistrationError>,
}

impl Registrar<'_> {
    /// Declare a parameter. The stored name is qualified with the module
    /// name (`<module>.<name>`).
    pub fn define_param(&mut self, name: &str) -> ParamId {
        let qualified = CompactString::from(format!("{}.{}", self.module, name));
        if let Some(&id) = self.param_index.get(&qualified) {
            self.error.get_or_insert(RegistrationError::DuplicateParam {
                name: qualified.into(),
            });
            return id;
        }
        let id = ParamId(self.params.len());
        self.params.push(ParamDef {
            id,
            name: qualified.clone(),
        });
        self.param_index.insert(qualified, id);
        id
    }

    /// Declare an event. Event names are global and unqualified.
    pub fn define_event(&mut self, name: &str) -> EventId {
        let name = CompactString::from(name);
        if let Some(&id) = self.event_index.get(&name) {
            self.error.get_or_insert(RegistrationError::DuplicateEvent {
                name: name.into(),
            });
            return id;
        }
        let id = EventId(self.events.len());
        self.events.push(EventDef {
            id,
            name: name.clone(),
        });
        self.event_index.insert(name, id);
        id
    }
}

/// Setup-time context handed to [`Module::setup`].
pub struct Resolver<'a> {
    index: &'a HashMap<CompactString, ModuleId>,
}

impl Resolver<'_> {
    /// Look up a module by name; `None` when it is not part of this chain.
    pub fn lookup(&self, name: &str) -> Option<ModuleId> {
        self.index.get(name).copied()
    }

    /// Look up a module that must be present.
    pub fn require(&self, name: &str) -> Result<ModuleId, RegistrationError> {
        self.lookup(name)
            .ok_or_else(|| RegistrationError::UnknownModule { name: name.into() })
    }
}

struct ModuleSlot {
    name: &'static str,
    module: Box<dyn Module>,
}

/// Ordered module chain plus the global parameter and event tables.
pub struct Decoder {
    modules: Vec<ModuleSlot>,
    module_index: HashMap<CompactString, ModuleId>,
    params: Vec<ParamDef>,
    events: Vec<EventDef>,
    param_index: HashMap<CompactString, ParamId>,
    event_index: HashMap<CompactString, EventId>,
    root: Option<ModuleId>,
    ready: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            module_index: HashMap::new(),
            params: Vec::new(),
            events: Vec::new(),
            param_index: HashMap::new(),
            event_index: HashMap::new(),
            root: None,
            ready: false,
        }
    }

    /// Register a module. The first module registered becomes the root of
    /// the decode walk (the link layer, by convention).
    pub fn register<M: Module + 'static>(
        &mut self,
        mut module: M,
    ) -> Result<ModuleId, RegistrationError> {
        let name = module.name();
        if self.module_index.contains_key(name) {
            return Err(RegistrationError::DuplicateModule { name: name.into() });
        }

        let mut error = None;
        module.declare(&mut Registrar {
            module: name,
            params: &mut self.params,
            events: &mut self.events,
            param_index: &mut self.param_index,
            event_index: &mut self.event_index,
            error: &mut error,
        });
        if let Some(err) = error {
            return Err(err);
        }

        let id = ModuleId(self.modules.len());
        self.module_index.insert(CompactString::from(name), id);
        self.modules.push(ModuleSlot {
            name,
            module: Box::new(module),
        });
        self.root.get_or_insert(id);
        self.ready = false;
        Ok(id)
    }

    /// Resolve cross-module references and validate the chain. Must run
    /// once after registration, before the first `decode`.
    pub fn setup(&mut self) -> Result<(), RegistrationError> {
        if self.modules.is_empty() {
            return Err(RegistrationError::EmptyChain);
        }
        let resolver = Resolver {
            index: &self.module_index,
        };
        for slot in &mut self.modules {
            slot.module.setup(&resolver)?;
        }
        self.check_cycles()?;
        self.ready = true;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Walk the module chain for one packet.
    pub fn decode<'p>(&mut self, payload: &mut Payload<'p>, prop: &mut Property<'p>) {
        if !self.ready {
            warn!("decode called before setup; packet dropped");
            return;
        }
        let mut next = self.root;
        while let Some(id) = next {
            next = self.modules[id.0].module.decode(payload, prop);
        }
    }

    pub fn module_id(&self, name: &str) -> Option<ModuleId> {
        self.module_index.get(name).copied()
    }

    pub fn param_id(&self, name: &str) -> Option<ParamId> {
        self.param_index.get(name).copied()
    }

    pub fn event_id(&self, name: &str) -> Option<EventId> {
        self.event_index.get(name).copied()
    }

    pub fn param_def(&self, id: ParamId) -> Option<&ParamDef> {
        self.params.get(id.0)
    }

    pub fn event_def(&self, id: EventId) -> Option<&EventDef> {
        self.events.get(id.0)
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Iterate the declared event names in id order.
    pub fn events(&self) -> impl Iterator<Item = &EventDef> {
        self.events.iter()
    }

    /// Depth-first search over the declared `children()` edges. A back
    /// edge means the chain could hand a packet around in a loop forever.
    fn check_cycles(&self) -> Result<(), RegistrationError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        fn visit(
            decoder: &Decoder,
            id: ModuleId,
            marks: &mut [Mark],
        ) -> Result<(), RegistrationError> {
            marks[id.0] = Mark::Grey;
            for child in decoder.modules[id.0].module.children() {
                let Some(cid) = decoder.module_id(child) else {
                    // Children not registered in this chain are simply
                    // never reached.
                    continue;
                };
                match marks[cid.0] {
                    Mark::Grey => {
                        return Err(RegistrationError::DecodeCycle {
                            name: decoder.modules[cid.0].name.into(),
                        })
                    }
                    Mark::White => visit(decoder, cid, marks)?,
                    Mark::Black => {}
                }
            }
            marks[id.0] = Mark::Black;
            Ok(())
        }

        let mut marks = vec![Mark::White; self.modules.len()];
        for i in 0..self.modules.len() {
            if marks[i] == Mark::White {
                visit(self, ModuleId(i), &mut marks)?;
            }
        }
        Ok(())
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
