// Message-passing boundary between OS event sources and the controller
use crate::error::HookError;
use claritylayer_core::log_info;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Commands from the hotkey or menu layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "camelCase")]
pub enum Command {
    Enable(bool),
    Toggle,
    SetParameter { name: String, value: f32 },
    ApplyProfile(String),
    PanicOff,
    ExitSafeMode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    DisplayChanged,
    DpiChanged,
    SystemResumed,
    DeviceRecovered,
    /// Device recovery failed and effects were switched off.
    SurfaceFailed,
    Command(Command),
}

/// Cloneable producer side of the event queue. Never blocks.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<ControlEvent>,
}

impl EventSender {
    /// Returns false once the hub is gone.
    pub fn send(&self, event: ControlEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn command(&self, command: Command) -> bool {
        self.send(ControlEvent::Command(command))
    }
}

pub struct EventHub {
    tx: Sender<ControlEvent>,
    rx: Receiver<ControlEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(&self) -> EventSender {
        EventSender { tx: self.tx.clone() }
    }

    /// Everything queued so far, in arrival order.
    pub fn drain(&self) -> Vec<ControlEvent> {
        self.rx.try_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

/// Source of external events. Only one hook per kind can be installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Display,
    Power,
    Keyboard,
}

impl HookKind {
    pub fn name(self) -> &'static str {
        match self {
            HookKind::Display => "display",
            HookKind::Power => "power",
            HookKind::Keyboard => "keyboard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

impl HookId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    installed: HashMap<HookId, HookKind>,
}

/// Explicit replacement for a process-wide hook pointer.
#[derive(Clone, Default)]
pub struct HookRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, kind: HookKind, events: EventSender) -> Result<EventHook, HookError> {
        let mut registry = self.inner.lock();
        if registry.installed.values().any(|k| *k == kind) {
            return Err(HookError::AlreadyInstalled(kind.name()));
        }
        registry.next_id += 1;
        let id = HookId(registry.next_id);
        registry.installed.insert(id, kind);
        log_info!("Installed {} hook #{}", kind.name(), id.0);

        Ok(EventHook {
            id,
            kind,
            registry: Arc::downgrade(&self.inner),
            events,
        })
    }

    pub fn is_installed(&self, kind: HookKind) -> bool {
        self.inner.lock().installed.values().any(|k| *k == kind)
    }

    pub fn lookup(&self, id: HookId) -> Option<HookKind> {
        self.inner.lock().installed.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().installed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Installed hook. Unregisters itself when dropped.
pub struct EventHook {
    id: HookId,
    kind: HookKind,
    registry: Weak<Mutex<Registry>>,
    events: EventSender,
}

impl EventHook {
    pub fn id(&self) -> HookId {
        self.id
    }

    pub fn kind(&self) -> HookKind {
        self.kind
    }

    /// Forwards an event from whatever thread the OS calls us on.
    pub fn emit(&self, event: ControlEvent) -> bool {
        self.events.send(event)
    }
}

impl Drop for EventHook {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().installed.remove(&self.id);
            tracing::debug!("Removed {} hook #{}", self.kind.name(), self.id.0);
        }
    }
}
