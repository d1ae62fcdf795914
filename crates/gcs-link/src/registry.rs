use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

use serde::Serialize;

use crate::command::{CommandContext, CommandId, CorrelationKey};
use crate::discovery::{ComponentDiscoveryState, DiscoveryPhase};

/// The in-flight command for a correlation key plus any queued duplicates.
#[derive(Debug)]
pub struct CommandSlot {
    pub(crate) active: CommandContext,
    pub(crate) queued: VecDeque<CommandContext>,
}

impl CommandSlot {
    pub fn new(active: CommandContext) -> Self {
        Self { active, queued: VecDeque::new() }
    }

    pub fn active(&self) -> &CommandContext {
        &self.active
    }

    pub fn queued(&self) -> usize {
        self.queued.len()
    }
}

#[derive(Debug)]
pub struct ComponentRecord {
    pub id: u8,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub discovery: Option<ComponentDiscoveryState>,
    pub commands: HashMap<u16, CommandSlot>,
}

impl ComponentRecord {
    fn new(id: u8, now: Instant) -> Self {
        Self { id, first_seen: now, last_seen: now, discovery: None, commands: HashMap::new() }
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.values().map(|s| 1 + s.queued.len()).sum()
    }
}

/// Per-component state of the remote system. Records are created on first
/// contact and kept for the lifetime of the session.
#[derive(Debug, Default)]
pub struct Registry {
    components: BTreeMap<u8, ComponentRecord>,
    /// responsible sub-component id -> owning component id
    responsible_index: HashMap<u8, u8>,
    handles: HashMap<CommandId, CorrelationKey>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records contact with `id`, creating it if unseen. Returns true for a new record.
    pub fn touch(&mut self, id: u8, now: Instant) -> bool {
        match self.components.get_mut(&id) {
            Some(rec) => {
                rec.last_seen = now;
                false
            }
            None => {
                self.components.insert(id, ComponentRecord::new(id, now));
                true
            }
        }
    }

    pub fn get(&self, id: u8) -> Option<&ComponentRecord> {
        self.components.get(&id)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut ComponentRecord> {
        self.components.get_mut(&id)
    }

    pub fn discovery(&self, id: u8) -> Option<&ComponentDiscoveryState> {
        self.components.get(&id).and_then(|r| r.discovery.as_ref())
    }

    pub fn discovery_mut(&mut self, id: u8) -> Option<&mut ComponentDiscoveryState> {
        self.components.get_mut(&id).and_then(|r| r.discovery.as_mut())
    }

    /// Creates the discovery state for a known component. Returns false when
    /// the component is unknown or already has one.
    pub fn insert_discovery(&mut self, state: ComponentDiscoveryState) -> bool {
        match self.components.get_mut(&state.component_id()) {
            Some(rec) if rec.discovery.is_none() => {
                rec.discovery = Some(state);
                true
            }
            _ => false,
        }
    }

    /// Updates the responsible index for `owner`. Returns true if the mapping changed.
    pub fn set_responsible(&mut self, owner: u8, responsible: u8) -> bool {
        let Some(state) = self.discovery_mut(owner) else { return false };
        let previous = state.responsible_id;
        if previous == Some(responsible) {
            return false;
        }
        state.responsible_id = Some(responsible);
        if let Some(prev) = previous {
            if self.responsible_index.get(&prev) == Some(&owner) {
                self.responsible_index.remove(&prev);
            }
        }
        self.responsible_index.insert(responsible, owner);
        true
    }

    pub fn owner_of_responsible(&self, responsible: u8) -> Option<u8> {
        self.responsible_index.get(&responsible).copied()
    }

    pub fn slot(&self, key: CorrelationKey) -> Option<&CommandSlot> {
        self.components.get(&key.target_component)?.commands.get(&key.command)
    }

    pub fn slot_mut(&mut self, key: CorrelationKey) -> Option<&mut CommandSlot> {
        self.components.get_mut(&key.target_component)?.commands.get_mut(&key.command)
    }

    pub fn is_pending(&self, key: CorrelationKey) -> bool {
        self.slot(key).is_some()
    }

    /// Stores a new slot, creating the target record if commands go out before
    /// we have heard from it.
    pub fn insert_slot(&mut self, key: CorrelationKey, slot: CommandSlot, now: Instant) {
        self.components
            .entry(key.target_component)
            .or_insert_with(|| ComponentRecord::new(key.target_component, now))
            .commands
            .insert(key.command, slot);
    }

    pub fn remove_slot(&mut self, key: CorrelationKey) -> Option<CommandSlot> {
        self.components.get_mut(&key.target_component)?.commands.remove(&key.command)
    }

    pub fn command_slots(&self) -> impl Iterator<Item = (CorrelationKey, &CommandSlot)> + '_ {
        self.components.values().flat_map(|rec| {
            rec.commands
                .iter()
                .map(move |(command, slot)| (CorrelationKey::new(rec.id, *command), slot))
        })
    }

    /// Takes every command slot out of the registry; component records stay.
    pub fn drain_slots(&mut self) -> Vec<(CorrelationKey, CommandSlot)> {
        let mut drained = Vec::new();
        for rec in self.components.values_mut() {
            let id = rec.id;
            drained.extend(rec.commands.drain().map(|(command, slot)| (CorrelationKey::new(id, command), slot)));
        }
        drained
    }

    pub fn pending_count(&self) -> usize {
        self.components.values().map(ComponentRecord::pending_commands).sum()
    }

    pub fn register_handle(&mut self, id: CommandId, key: CorrelationKey) {
        self.handles.insert(id, key);
    }

    pub fn release_handle(&mut self, id: CommandId) {
        self.handles.remove(&id);
    }

    pub fn key_for(&self, id: CommandId) -> Option<CorrelationKey> {
        self.handles.get(&id).copied()
    }

    pub fn snapshot(&self, now: Instant) -> RegistrySnapshot {
        let components = self
            .components
            .values()
            .map(|rec| {
                let discovery = rec.discovery.as_ref();
                ComponentSnapshot {
                    id: rec.id,
                    phase: discovery.map(|d| d.phase()).unwrap_or(DiscoveryPhase::Unknown),
                    responsible_id: discovery.and_then(|d| d.responsible_id()),
                    steps: discovery.map(StepFlags::from).unwrap_or_default(),
                    pending_commands: rec.pending_commands(),
                    idle_ms: now.saturating_duration_since(rec.last_seen).as_millis() as u64,
                }
            })
            .collect();
        RegistrySnapshot { components }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepFlags {
    pub information: bool,
    pub status: bool,
    pub live_data: bool,
}

impl From<&ComponentDiscoveryState> for StepFlags {
    fn from(d: &ComponentDiscoveryState) -> Self {
        Self {
            information: d.received_information(),
            status: d.received_status(),
            live_data: d.received_live_data(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentSnapshot {
    pub id: u8,
    pub phase: DiscoveryPhase,
    pub responsible_id: Option<u8>,
    pub steps: StepFlags,
    pub pending_commands: usize,
    pub idle_ms: u64,
}

/// Copy of the registry for readers outside the session task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub components: Vec<ComponentSnapshot>,
}

impl RegistrySnapshot {
    pub fn component(&self, id: u8) -> Option<&ComponentSnapshot> {
        self.components.iter().find(|c| c.id == id)
    }
}
