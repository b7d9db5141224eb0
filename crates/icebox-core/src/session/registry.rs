use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
    time::Instant,
};

use indexmap::IndexMap;

use crate::{
    os::ThreadObject, BreakpointId, BreakpointKind, Channel, Pa, RunControl, Session, VmError,
    VmEvent,
};

/// A callback fired when a logical breakpoint matches an event.
pub type BreakpointCallback<C> = dyn FnMut(&Session<C>, &VmEvent) -> RunControl;

/// A logical breakpoint entry.
pub(crate) struct Logical<C>
where
    C: Channel,
{
    pub pa: Pa,
    pub filter: Option<ThreadObject>,
    pub one_shot: bool,
    pub hits: Cell<u64>,
    pub installed_at: Instant,
    pub callback: Rc<RefCell<BreakpointCallback<C>>>,
}

/// A channel-side breakpoint slot shared by the logical entries at one
/// physical address.
struct Slot {
    id: BreakpointId,
    kind: BreakpointKind,
    holders: u32,
}

/// The breakpoint registry.
///
/// One physical slot per address, installed on first reference and removed
/// when the last logical holder goes away. Logical entries keep their
/// insertion order; dispatch iterates them in that order.
pub(crate) struct Registry<C>
where
    C: Channel,
{
    slots: HashMap<Pa, Slot>,
    logical: IndexMap<u32, Logical<C>>,
    next_key: u32,
}

impl<C> Registry<C>
where
    C: Channel,
{
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            logical: IndexMap::new(),
            next_key: 0,
        }
    }

    /// Registers a logical breakpoint, installing the channel slot if this is
    /// the first holder at the address.
    pub fn insert(
        &mut self,
        channel: &C,
        pa: Pa,
        kind: BreakpointKind,
        filter: Option<ThreadObject>,
        one_shot: bool,
        callback: Rc<RefCell<BreakpointCallback<C>>>,
    ) -> Result<u32, VmError> {
        match self.slots.get_mut(&pa) {
            Some(slot) => {
                if slot.kind != kind {
                    return Err(VmError::BreakpointConflict(pa));
                }
                slot.holders += 1;

                tracing::debug!(%pa, holders = slot.holders, "breakpoint slot shared");
            }
            None => {
                let id = channel.add_breakpoint(pa, kind)?;
                self.slots.insert(
                    pa,
                    Slot {
                        id,
                        kind,
                        holders: 1,
                    },
                );

                tracing::debug!(%pa, %id, "breakpoint slot installed");
            }
        }

        let key = self.next_key;
        self.next_key += 1;

        self.logical.insert(
            key,
            Logical {
                pa,
                filter,
                one_shot,
                hits: Cell::new(0),
                installed_at: Instant::now(),
                callback,
            },
        );

        Ok(key)
    }

    /// Drops a logical breakpoint; removes the channel slot when this was the
    /// last holder at its address.
    ///
    /// Returns `false` if the key was already gone (e.g. a one-shot that has
    /// fired).
    pub fn remove(&mut self, channel: &C, key: u32) -> Result<bool, VmError> {
        let entry = match self.logical.shift_remove(&key) {
            Some(entry) => entry,
            None => return Ok(false),
        };

        tracing::debug!(
            pa = %entry.pa,
            hits = entry.hits.get(),
            lifetime_ms = entry.installed_at.elapsed().as_millis() as u64,
            "breakpoint unregistered"
        );

        self.release_slot(channel, entry.pa)?;
        Ok(true)
    }

    /// Collects the callbacks matching a breakpoint hit, consuming one-shot
    /// entries before their callbacks can run.
    pub fn collect_matches(
        &mut self,
        channel: &C,
        pa: Pa,
        thread: Option<ThreadObject>,
    ) -> Result<Vec<Rc<RefCell<BreakpointCallback<C>>>>, VmError> {
        let matching: Vec<u32> = self
            .logical
            .iter()
            .filter(|(_, entry)| {
                entry.pa == pa
                    && match (entry.filter, thread) {
                        (None, _) => true,
                        (Some(filter), Some(current)) => filter == current,
                        (Some(_), None) => false,
                    }
            })
            .map(|(&key, _)| key)
            .collect();

        let mut callbacks = Vec::with_capacity(matching.len());

        for key in matching {
            let entry = &self.logical[&key];
            entry.hits.set(entry.hits.get() + 1);

            if entry.one_shot {
                // Consumed before the callback runs so it can re-arm safely.
                let entry = self
                    .logical
                    .shift_remove(&key)
                    .expect("one-shot entry vanished during collection");
                self.release_slot(channel, entry.pa)?;
                callbacks.push(entry.callback);
            }
            else {
                callbacks.push(self.logical[&key].callback.clone());
            }
        }

        Ok(callbacks)
    }

    /// Returns the hit count of a logical breakpoint, if it is still
    /// registered.
    pub fn hits(&self, key: u32) -> Option<u64> {
        Some(self.logical.get(&key)?.hits.get())
    }

    /// Removes every logical entry and channel slot.
    pub fn clear(&mut self, channel: &C) {
        self.logical.clear();

        for (pa, slot) in self.slots.drain() {
            if let Err(err) = channel.remove_breakpoint(slot.id) {
                tracing::error!(%err, %pa, "failed to remove breakpoint slot");
            }
        }
    }

    /// Returns the number of logical entries at a physical address.
    pub fn holders_at(&self, pa: Pa) -> usize {
        self.logical.values().filter(|entry| entry.pa == pa).count()
    }

    /// Returns whether any slot is installed.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn release_slot(&mut self, channel: &C, pa: Pa) -> Result<(), VmError> {
        let slot = self
            .slots
            .get_mut(&pa)
            .expect("logical entry without a physical slot");

        slot.holders -= 1;

        if slot.holders == 0 {
            let id = slot.id;
            self.slots.remove(&pa);
            channel.remove_breakpoint(id)?;

            tracing::debug!(%pa, %id, "breakpoint slot removed");
        }

        Ok(())
    }
}
