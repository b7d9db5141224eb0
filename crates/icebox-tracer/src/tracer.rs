use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    rc::Rc,
};

use icebox_core::{
    arch::Registers,
    os::{GuestOs, Process, Thread, ThreadObject},
    Breakpoint, BreakpointGuard, Channel, RunControl, Session, ThreadResolver, Va, VcpuId, Vm,
    VmError, VmEvent,
};

use crate::{ArgDef, ArgKind, ArgValue, FunctionDef};

/// Error type for the tracing engine.
#[derive(thiserror::Error, Debug)]
pub enum TracerError {
    /// A second plugin tried to trace a function that already has an entry
    /// hook. Conflicting argument rewrites would otherwise depend on
    /// registration order.
    #[error("{module}!{name} is already traced")]
    AlreadyTraced {
        /// The module of the rejected registration.
        module: &'static str,
        /// The function of the rejected registration.
        name: &'static str,
    },
}

impl From<TracerError> for VmError {
    fn from(value: TracerError) -> Self {
        Self::Tracer(Box::new(value))
    }
}

/// Diagnostic counters kept by the tracer.
#[derive(Debug, Default)]
pub struct TracerStats {
    entries: Cell<u64>,
    returns: Cell<u64>,
    reentries_skipped: Cell<u64>,
    argument_read_failures: Cell<u64>,
    callback_failures: Cell<u64>,
    thread_resolution_failures: Cell<u64>,
}

impl TracerStats {
    /// Entry hooks that ran their callback.
    pub fn entries(&self) -> u64 {
        self.entries.get()
    }

    /// Return hooks that fired.
    pub fn returns(&self) -> u64 {
        self.returns.get()
    }

    /// Entry hits filtered out as re-entrant.
    pub fn reentries_skipped(&self) -> u64 {
        self.reentries_skipped.get()
    }

    /// Arguments that decoded to [`ArgValue::Absent`].
    pub fn argument_read_failures(&self) -> u64 {
        self.argument_read_failures.get()
    }

    /// Entry callbacks that returned an error (no return hook installed).
    pub fn callback_failures(&self) -> u64 {
        self.callback_failures.get()
    }

    /// Hooks aborted because the executing thread could not be resolved.
    pub fn thread_resolution_failures(&self) -> u64 {
        self.thread_resolution_failures.get()
    }

    fn bump(cell: &Cell<u64>) {
        cell.set(cell.get() + 1);
    }
}

struct Inner {
    stats: TracerStats,
    /// `(family, thread)` pairs with an outstanding return hook.
    inflight: RefCell<HashSet<(&'static str, ThreadObject)>>,
}

/// A function entry hit, handed to the entry callback.
///
/// Arguments are decoded per the declarative schema; the callback may
/// rewrite arguments (flushed to the vCPU before the callee executes) and
/// request a return hook.
pub struct EntryEvent<'a, C, Os>
where
    C: Channel,
    Os: GuestOs<C>,
{
    vm: &'a Vm<C>,
    os: &'a Os,
    registers: Registers,
    thread: Thread,
    vcpu: VcpuId,
    args: Vec<ArgValue>,
    return_hook: Option<Box<dyn FnMut(&mut ReturnEvent) + 'static>>,
    dirty: bool,
}

static ABSENT: ArgValue = ArgValue::Absent;

impl<C, Os> EntryEvent<'_, C, Os>
where
    C: Channel,
    Os: GuestOs<C>,
{
    /// Returns the decoded arguments, in schema order.
    pub fn args(&self) -> &[ArgValue] {
        &self.args
    }

    /// Returns one decoded argument ([`ArgValue::Absent`] when out of
    /// range).
    pub fn arg(&self, index: usize) -> &ArgValue {
        self.args.get(index).unwrap_or(&ABSENT)
    }

    /// Returns the register state at the function entry.
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Returns the thread the call was made on.
    pub fn thread(&self) -> Thread {
        self.thread
    }

    /// Returns the memory/register facade, for custom dereferencing.
    pub fn vm(&self) -> &Vm<C> {
        self.vm
    }

    /// Rewrites the `index`-th argument before the callee executes.
    pub fn set_arg(&mut self, index: u64, value: u64) -> Result<(), VmError> {
        self.os
            .set_function_argument(self.vm, &mut self.registers, index, value)?;
        self.dirty = true;
        Ok(())
    }

    /// Reads the caller's return address from the stack.
    pub fn return_address(&self) -> Result<Va, VmError> {
        self.os.return_address(self.vm, &self.registers)
    }

    /// Requests a one-shot return hook on this call, fired at the matching
    /// return on the same thread.
    pub fn hook_return(&mut self, callback: impl FnMut(&mut ReturnEvent) + 'static) {
        self.return_hook = Some(Box::new(callback));
    }
}

/// A function return hit, handed to the return callback.
pub struct ReturnEvent {
    registers: Registers,
    thread: Thread,
    vcpu: VcpuId,
    return_address: Va,
    dirty: bool,
}

impl ReturnEvent {
    /// Returns the register state at the return site.
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Returns the thread the call returned on (the thread the entry hook
    /// observed).
    pub fn thread(&self) -> Thread {
        self.thread
    }

    /// Returns the vCPU the return fired on.
    pub fn vcpu(&self) -> VcpuId {
        self.vcpu
    }

    /// Returns the return address the hook was keyed on.
    pub fn return_address(&self) -> Va {
        self.return_address
    }

    /// Returns the function result register.
    pub fn return_value(&self) -> u64 {
        self.registers.result()
    }

    /// Rewrites the function result register.
    pub fn set_return_value(&mut self, value: u64) {
        self.registers.set_result(value);
        self.dirty = true;
    }
}

/// The function-entry interception engine.
///
/// Plugins register interest in functions from the declarative schema; the
/// tracer resolves each target through the OS model, installs entry
/// breakpoints scoped to the target process, decodes arguments on a hit and
/// manages one-shot return hooks keyed on `(return address, thread)`.
pub struct Tracer<C, Os>
where
    C: Channel,
    Os: GuestOs<C>,
{
    session: Session<C>,
    os: Rc<Os>,
    inner: Rc<Inner>,
    entry_guards: RefCell<Vec<BreakpointGuard<C>>>,
    return_guards: Rc<RefCell<HashMap<(Va, ThreadObject), BreakpointGuard<C>>>>,
    traced: RefCell<HashSet<(&'static str, &'static str)>>,
}

impl<C, Os> Tracer<C, Os>
where
    C: Channel,
    Os: GuestOs<C> + 'static,
{
    /// Creates a tracer over a session, wiring the OS model in as the
    /// session's thread resolver.
    pub fn new(session: Session<C>, os: Rc<Os>) -> Self {
        let resolver_os = os.clone();
        let resolver: ThreadResolver<C> = Box::new(move |vm, event| {
            resolver_os
                .current_thread(vm, event.registers())
                .map(|thread| thread.object)
                .ok()
        });
        session.set_thread_resolver(resolver);

        Self {
            session,
            os,
            inner: Rc::new(Inner {
                stats: TracerStats::default(),
                inflight: RefCell::new(HashSet::new()),
            }),
            entry_guards: RefCell::new(Vec::new()),
            return_guards: Rc::new(RefCell::new(HashMap::new())),
            traced: RefCell::new(HashSet::new()),
        }
    }

    /// Returns the session driving this tracer.
    pub fn session(&self) -> &Session<C> {
        &self.session
    }

    /// Returns the diagnostic counters.
    pub fn stats(&self) -> &TracerStats {
        &self.inner.stats
    }

    /// Installs an entry hook for a schema entry, scoped to `process`.
    ///
    /// A second registration for the same `(module, name)` target is
    /// rejected: two plugins rewriting the same arguments would otherwise
    /// race on registration order.
    pub fn trace(
        &self,
        def: &'static FunctionDef,
        process: &Process,
        mut callback: impl FnMut(&mut EntryEvent<'_, C, Os>) -> Result<(), VmError> + 'static,
    ) -> Result<(), VmError> {
        if !self.traced.borrow_mut().insert((def.module, def.name)) {
            return Err(TracerError::AlreadyTraced {
                module: def.module,
                name: def.name,
            }
            .into());
        }

        let vm = self.session.vm();

        let va = self.os.resolve_symbol(vm, process, def.module, def.name)?;
        let pa = self.os.reader(vm, process).translate(va)?;

        tracing::debug!(
            module = def.module,
            function = def.name,
            %va,
            %pa,
            "installing entry hook"
        );

        let os = self.os.clone();
        let inner = self.inner.clone();
        let return_guards = self.return_guards.clone();
        let dtb = process.dtb;

        let guard = self.session.insert_breakpoint(
            Breakpoint::new(pa),
            move |session, event| {
                // Scope to the target process: another address space mapping
                // the same frame is not our call.
                if event.registers().dtb() != dtb {
                    return RunControl::Continue;
                }

                if let Err(err) =
                    handle_entry(session, event, &os, &inner, &return_guards, def, &mut callback)
                {
                    tracing::warn!(%err, function = def.name, "entry hook aborted");
                }

                RunControl::Continue
            },
        )?;

        self.entry_guards.borrow_mut().push(guard);
        Ok(())
    }

    /// Cancels the outstanding return hooks of a terminated thread.
    ///
    /// Every installed return hook is consumed exactly once: either by
    /// firing at its return site, or here when its thread is gone.
    pub fn cancel_thread(&self, thread: ThreadObject) {
        self.inner
            .inflight
            .borrow_mut()
            .retain(|(_, t)| *t != thread);

        let stale: Vec<_> = self
            .return_guards
            .borrow()
            .keys()
            .filter(|(_, t)| *t == thread)
            .copied()
            .collect();

        for key in stale {
            if let Some(guard) = self.return_guards.borrow_mut().remove(&key) {
                drop(guard);
                tracing::debug!(thread = %thread, va = %key.0, "cancelled return hook");
            }
        }
    }
}

fn handle_entry<C, Os>(
    session: &Session<C>,
    event: &VmEvent,
    os: &Rc<Os>,
    inner: &Rc<Inner>,
    return_guards: &Rc<RefCell<HashMap<(Va, ThreadObject), BreakpointGuard<C>>>>,
    def: &'static FunctionDef,
    callback: &mut dyn FnMut(&mut EntryEvent<'_, C, Os>) -> Result<(), VmError>,
) -> Result<(), VmError>
where
    C: Channel,
    Os: GuestOs<C> + 'static,
{
    let vm = session.vm();

    let thread = match os.current_thread(vm, event.registers()) {
        Ok(thread) => thread,
        Err(err) => {
            TracerStats::bump(&inner.stats.thread_resolution_failures);
            return Err(err);
        }
    };

    if inner
        .inflight
        .borrow()
        .contains(&(def.family, thread.object))
    {
        TracerStats::bump(&inner.stats.reentries_skipped);
        tracing::trace!(
            function = def.name,
            thread = %thread.object,
            "nested call skipped"
        );
        return Ok(());
    }

    TracerStats::bump(&inner.stats.entries);

    let registers = *event.registers();

    let args = def
        .args
        .iter()
        .enumerate()
        .map(|(index, arg)| decode_argument(vm, os.as_ref(), &registers, index as u64, arg, inner))
        .collect();

    let mut entry = EntryEvent {
        vm,
        os: os.as_ref(),
        registers,
        thread,
        vcpu: event.vcpu(),
        args,
        return_hook: None,
        dirty: false,
    };

    let outcome = callback(&mut entry);

    let EntryEvent {
        registers,
        return_hook,
        dirty,
        ..
    } = entry;

    if dirty {
        vm.set_registers(event.vcpu(), registers)?;
    }

    let return_callback = match outcome {
        Ok(()) => return_hook,
        Err(err) => {
            // A failed callback means: no return hook.
            TracerStats::bump(&inner.stats.callback_failures);
            tracing::warn!(%err, function = def.name, "entry callback failed");
            None
        }
    };

    let mut return_callback = match return_callback {
        Some(callback) => callback,
        None => return Ok(()),
    };

    // Key the one-shot on (return address, thread). A hook already pending
    // for this key means a re-entrant call the plugin contract forbids;
    // filter it at registration time.
    let return_address = os.return_address(vm, event.registers())?;
    let key = (return_address, thread.object);

    if return_guards.borrow().contains_key(&key) {
        TracerStats::bump(&inner.stats.reentries_skipped);
        return Ok(());
    }

    let return_pa = vm
        .reader(event.registers(), event.registers().dtb())
        .translate(return_address)?;

    inner
        .inflight
        .borrow_mut()
        .insert((def.family, thread.object));

    let hook_inner = inner.clone();
    let hook_guards = return_guards.clone();
    let family = def.family;

    let guard = session.insert_breakpoint(
        Breakpoint::new(return_pa).thread(thread.object).one_shot(),
        move |session, event| {
            hook_inner
                .inflight
                .borrow_mut()
                .remove(&(family, thread.object));
            hook_guards.borrow_mut().remove(&key);
            TracerStats::bump(&hook_inner.stats.returns);

            let mut ret = ReturnEvent {
                registers: *event.registers(),
                thread,
                vcpu: event.vcpu(),
                return_address,
                dirty: false,
            };

            return_callback(&mut ret);

            if ret.dirty
                && let Err(err) = session.vm().set_registers(event.vcpu(), ret.registers)
            {
                tracing::error!(%err, "failed to flush rewritten return registers");
            }

            RunControl::Continue
        },
    )?;

    return_guards.borrow_mut().insert(key, guard);

    tracing::trace!(
        function = def.name,
        %return_address,
        thread = %thread.object,
        "return hook installed"
    );

    Ok(())
}

fn decode_argument<C, Os>(
    vm: &Vm<C>,
    os: &Os,
    registers: &Registers,
    index: u64,
    def: &ArgDef,
    inner: &Inner,
) -> ArgValue
where
    C: Channel,
    Os: GuestOs<C>,
{
    let raw = match os.function_argument(vm, registers, index) {
        Ok(raw) => raw,
        Err(err) => {
            TracerStats::bump(&inner.stats.argument_read_failures);
            tracing::debug!(%err, argument = def.name, "argument read failed");
            return ArgValue::Absent;
        }
    };

    match def.kind {
        ArgKind::U8 => ArgValue::U8(raw as u8),
        ArgKind::U16 => ArgValue::U16(raw as u16),
        ArgKind::U32 => ArgValue::U32(raw as u32),
        ArgKind::U64 => ArgValue::U64(raw),
        ArgKind::I32 => ArgValue::I32(raw as i32),
        ArgKind::I64 => ArgValue::I64(raw as i64),
        ArgKind::Ptr => ArgValue::Ptr(Va(raw)),
        ArgKind::Handle => ArgValue::Handle(raw),
        ArgKind::Enum(tag) => ArgValue::Enum { tag, value: raw },
        ArgKind::WStr { max_chars } => {
            if raw == 0 {
                TracerStats::bump(&inner.stats.argument_read_failures);
                return ArgValue::Absent;
            }

            let reader = vm.reader(registers, registers.dtb());
            match reader.read_utf16(Va(raw), max_chars) {
                Ok(string) => ArgValue::WStr(string),
                Err(err) => {
                    TracerStats::bump(&inner.stats.argument_read_failures);
                    tracing::debug!(%err, argument = def.name, "string argument unreadable");
                    ArgValue::Absent
                }
            }
        }
    }
}
