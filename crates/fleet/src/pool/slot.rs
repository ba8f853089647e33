//! Named worker slots and their instance bindings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compute::{Instance, InstanceState};

/// The instance currently occupying a slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub instance_id: String,
    pub state: InstanceState,
    pub launched_at: DateTime<Utc>,
}

impl From<&Instance> for Binding {
    fn from(instance: &Instance) -> Self {
        Self {
            instance_id: instance.id.clone(),
            state: instance.state,
            launched_at: instance.launched_at,
        }
    }
}

/// One named worker identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub name: String,
    pub binding: Option<Binding>,
}

impl Slot {
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }
}

/// Fixed, ordered set of slots `<prefix>-1 .. <prefix>-N`
///
/// Slot order is significant: new workers always go to the first unbound
/// slot. A given instance id is bound to at most one slot.
#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new(prefix: &str, max_slots: usize) -> Self {
        let slots = (1..=max_slots)
            .map(|i| Slot {
                name: format!("{prefix}-{i}"),
                binding: None,
            })
            .collect();
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Slot> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// First slot without a binding
    pub fn first_unbound(&self) -> Option<&str> {
        self.slots
            .iter()
            .find(|s| !s.is_bound())
            .map(|s| s.name.as_str())
    }

    pub fn bound_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_bound()).count()
    }

    /// Names of bound slots, in slot order
    pub fn bound_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| s.is_bound())
            .map(|s| s.name.clone())
            .collect()
    }

    /// Bind `instance` to the named slot
    ///
    /// Any other slot holding the same instance id is unbound first.
    /// Returns false when the slot name is unknown.
    pub fn bind(&mut self, name: &str, instance: &Instance) -> bool {
        if self.get(name).is_none() {
            return false;
        }
        for slot in &mut self.slots {
            if slot
                .binding
                .as_ref()
                .is_some_and(|b| b.instance_id == instance.id)
            {
                slot.binding = None;
            }
        }
        if let Some(slot) = self.slots.iter_mut().find(|s| s.name == name) {
            slot.binding = Some(Binding::from(instance));
        }
        true
    }

    /// Clear a slot's binding, returning what was bound
    pub fn unbind(&mut self, name: &str) -> Option<Binding> {
        self.slots
            .iter_mut()
            .find(|s| s.name == name)
            .and_then(|s| s.binding.take())
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.binding = None;
        }
    }

    /// Slot whose instance should be terminated next
    pub fn victim(&self) -> Option<&Slot> {
        select_victim(&self.slots)
    }
}

/// Termination tie-break over bound slots
///
/// The first Pending instance in slot order wins. With none pending, the
/// instance with the most recent launch time is chosen; on equal launch
/// times the later slot wins.
pub fn select_victim(slots: &[Slot]) -> Option<&Slot> {
    let bound = || slots.iter().filter(|s| s.is_bound());

    if let Some(pending) = bound().find(|s| {
        s.binding
            .as_ref()
            .is_some_and(|b| b.state == InstanceState::Pending)
    }) {
        return Some(pending);
    }

    bound().max_by_key(|s| s.binding.as_ref().map(|b| b.launched_at))
}
