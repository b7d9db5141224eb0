mod registry;

#[cfg(test)]
mod session_tests;

use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
    time::Duration,
};

pub use self::registry::BreakpointCallback;
use self::registry::Registry;
use crate::{
    os::ThreadObject, BreakpointKind, Channel, Pa, RunOutcome, Vm, VmError, VmEvent, VmEventKind,
};

/// The run-lifecycle of an attached guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No guest attached (after an explicit detach).
    Detached,

    /// All virtual CPUs are halted; guest state may be read and written.
    Paused,

    /// The guest is executing; only the event pump may be used.
    Running,
}

impl RunState {
    fn name(self) -> &'static str {
        match self {
            Self::Detached => "detached",
            Self::Paused => "paused",
            Self::Running => "running",
        }
    }
}

/// What a breakpoint callback wants the event loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    /// Keep pumping events.
    Continue,

    /// Return to the caller once the current event's callbacks have drained.
    Stop,
}

/// A breakpoint definition.
///
/// Builder-style: physical address plus optional kind, thread filter and
/// one-shot flag.
#[derive(Debug, Clone, Copy)]
pub struct Breakpoint {
    pa: Pa,
    kind: BreakpointKind,
    filter: Option<ThreadObject>,
    one_shot: bool,
}

impl Breakpoint {
    /// Creates a software execution breakpoint at a physical address.
    pub fn new(pa: Pa) -> Self {
        Self {
            pa,
            kind: BreakpointKind::SoftExec,
            filter: None,
            one_shot: false,
        }
    }

    /// Sets the breakpoint kind.
    pub fn kind(self, kind: BreakpointKind) -> Self {
        Self { kind, ..self }
    }

    /// Restricts the breakpoint to a single thread.
    pub fn thread(self, thread: ThreadObject) -> Self {
        Self {
            filter: Some(thread),
            ..self
        }
    }

    /// Marks the breakpoint as one-shot: it is removed from the registry the
    /// first time it fires, before its callback runs.
    pub fn one_shot(self) -> Self {
        Self {
            one_shot: true,
            ..self
        }
    }
}

/// Resolves the thread identity an event was raised on.
///
/// Thread identity is OS-specific, so the OS layer installs this hook; the
/// session itself only compares the opaque [`ThreadObject`] values.
pub type ThreadResolver<C> = Box<dyn Fn(&Vm<C>, &VmEvent) -> Option<ThreadObject>>;

struct SessionInner<C>
where
    C: Channel,
{
    vm: Vm<C>,
    state: Cell<RunState>,
    registry: RefCell<Registry<C>>,
    thread_resolver: RefCell<Option<ThreadResolver<C>>>,
}

/// The guest run-lifecycle coordinator.
///
/// Owns the breakpoint registry and the single event pump. All callbacks run
/// on this (single-threaded) loop, with the guest paused; concurrency with
/// the guest is enforced by pause/resume discipline rather than locks.
///
/// Sessions are cheaply cloneable handles to shared state, so callbacks can
/// hold one and install further breakpoints from inside the pump.
pub struct Session<C>
where
    C: Channel,
{
    inner: Rc<SessionInner<C>>,
}

impl<C> Clone for Session<C>
where
    C: Channel,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> Session<C>
where
    C: Channel,
{
    /// Attaches to a channel, pausing the guest.
    pub fn attach(channel: C) -> Result<Self, VmError> {
        channel.pause()?;

        tracing::debug!("attached, guest paused");

        Ok(Self {
            inner: Rc::new(SessionInner {
                vm: Vm::new(channel),
                state: Cell::new(RunState::Paused),
                registry: RefCell::new(Registry::new()),
                thread_resolver: RefCell::new(None),
            }),
        })
    }

    /// Returns the memory/register facade.
    pub fn vm(&self) -> &Vm<C> {
        &self.inner.vm
    }

    /// Returns the current run state.
    pub fn state(&self) -> RunState {
        self.inner.state.get()
    }

    /// Installs the OS-provided thread identity hook used by thread-filtered
    /// breakpoints.
    pub fn set_thread_resolver(&self, resolver: ThreadResolver<C>) {
        *self.inner.thread_resolver.borrow_mut() = Some(resolver);
    }

    /// Halts all guest virtual CPUs.
    pub fn pause(&self) -> Result<(), VmError> {
        self.expect_attached()?;

        self.inner.vm.channel().pause()?;
        self.inner.state.set(RunState::Paused);
        Ok(())
    }

    /// Resumes the guest.
    ///
    /// Every cached translation is dropped first: once the guest runs, its
    /// page tables are free to change.
    pub fn resume(&self) -> Result<(), VmError> {
        self.expect_attached()?;

        self.inner.vm.flush_translation_cache();
        self.inner.vm.channel().resume()?;
        self.inner.state.set(RunState::Running);
        Ok(())
    }

    /// Retires exactly one instruction on the given vCPU and returns the
    /// resulting event. The session remains paused.
    pub fn step_once(&self, vcpu: crate::VcpuId) -> Result<VmEvent, VmError> {
        self.expect_state(RunState::Paused)?;

        self.inner.vm.flush_translation_cache();
        self.inner.vm.channel().singlestep(vcpu)?;

        let event = self.inner.vm.wait_for_event(Duration::from_secs(5))?;

        if event.kind() != VmEventKind::Singlestep {
            tracing::warn!(kind = ?event.kind(), "unexpected event while single-stepping");
        }

        Ok(event)
    }

    /// Registers a logical breakpoint with a callback.
    ///
    /// Multiple logical breakpoints may share one physical slot; the channel
    /// byte is installed on first reference and restored when the last
    /// holder goes away. The returned guard unregisters the entry when
    /// dropped.
    pub fn insert_breakpoint(
        &self,
        breakpoint: Breakpoint,
        callback: impl FnMut(&Session<C>, &VmEvent) -> RunControl + 'static,
    ) -> Result<BreakpointGuard<C>, VmError> {
        self.expect_attached()?;

        let key = self.inner.registry.borrow_mut().insert(
            self.inner.vm.channel(),
            breakpoint.pa,
            breakpoint.kind,
            breakpoint.filter,
            breakpoint.one_shot,
            Rc::new(RefCell::new(callback)),
        )?;

        Ok(BreakpointGuard {
            session: Rc::downgrade(&self.inner),
            key,
        })
    }

    /// Resumes the guest and pumps events until the predicate matches or a
    /// callback requests a stop.
    ///
    /// All callbacks registered for an event run to completion (in
    /// registration order) before the verdict is taken, so a stopping
    /// callback never starves its peers. Timeouts are reported to the caller
    /// as [`RunOutcome::Timeout`] with the guest re-paused; callbacks never
    /// observe them.
    pub fn run_until(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&VmEvent) -> bool,
    ) -> Result<RunOutcome, VmError> {
        self.expect_attached()?;

        loop {
            self.resume()?;

            let event = match self.inner.vm.wait_for_event(timeout) {
                Ok(event) => event,
                Err(VmError::Timeout) => {
                    self.pause()?;
                    return Ok(RunOutcome::Timeout);
                }
                Err(err) => return Err(err),
            };

            // The counterpart pauses all vCPUs before publishing.
            self.inner.state.set(RunState::Paused);
            self.inner.vm.flush_translation_cache();

            if event.kind() == VmEventKind::Crash {
                tracing::error!("channel reported guest crash");
                return Ok(RunOutcome::Event(event));
            }

            let control = self.dispatch(&event)?;

            if control == RunControl::Stop || predicate(&event) {
                return Ok(RunOutcome::Event(event));
            }
        }
    }

    /// Detaches from the guest: removes every breakpoint, restores the
    /// overwritten bytes and resumes the guest.
    pub fn detach(&self) -> Result<(), VmError> {
        self.expect_attached()?;

        self.inner
            .registry
            .borrow_mut()
            .clear(self.inner.vm.channel());
        self.inner.vm.channel().resume()?;
        self.inner.state.set(RunState::Detached);

        tracing::debug!("detached");
        Ok(())
    }

    /// Pauses the guest and returns a guard that resumes it when dropped.
    pub fn pause_guard(&self) -> Result<SessionPauseGuard<'_, C>, VmError> {
        self.pause()?;
        Ok(SessionPauseGuard { session: self })
    }

    /// Fires the callbacks registered for a breakpoint event.
    fn dispatch(&self, event: &VmEvent) -> Result<RunControl, VmError> {
        let pa = match event.kind() {
            VmEventKind::Breakpoint { pa } => pa,
            _ => return Ok(RunControl::Continue),
        };

        let thread = self
            .inner
            .thread_resolver
            .borrow()
            .as_ref()
            .and_then(|resolver| resolver(&self.inner.vm, event));

        // One-shot entries are consumed inside this borrow, before any
        // callback runs; the borrow is released so callbacks may re-enter
        // the registry.
        let callbacks = self.inner.registry.borrow_mut().collect_matches(
            self.inner.vm.channel(),
            pa,
            thread,
        )?;

        if callbacks.is_empty() {
            tracing::debug!(%pa, "breakpoint hit without a matching logical entry");
        }

        let mut control = RunControl::Continue;

        for callback in callbacks {
            let mut callback = callback.borrow_mut();
            if (&mut *callback)(self, event) == RunControl::Stop {
                control = RunControl::Stop;
            }
        }

        Ok(control)
    }

    /// Returns the number of logical breakpoints at a physical address.
    pub fn breakpoints_at(&self, pa: Pa) -> usize {
        self.inner.registry.borrow().holders_at(pa)
    }

    fn expect_attached(&self) -> Result<(), VmError> {
        match self.inner.state.get() {
            RunState::Detached => Err(VmError::InvalidRunState {
                expected: "attached",
                actual: RunState::Detached.name(),
            }),
            _ => Ok(()),
        }
    }

    fn expect_state(&self, expected: RunState) -> Result<(), VmError> {
        let actual = self.inner.state.get();
        if actual != expected {
            return Err(VmError::InvalidRunState {
                expected: expected.name(),
                actual: actual.name(),
            });
        }
        Ok(())
    }
}

impl<C> Drop for SessionInner<C>
where
    C: Channel,
{
    fn drop(&mut self) {
        if self.state.get() != RunState::Detached {
            self.registry.borrow_mut().clear(self.vm.channel());
        }
    }
}

/// A handle to a registered breakpoint.
///
/// Dropping the guard unregisters the logical entry; the channel slot is
/// removed with the last holder. The guard holds the registry weakly, so a
/// session that has already been torn down makes the drop a no-op.
pub struct BreakpointGuard<C>
where
    C: Channel,
{
    session: Weak<SessionInner<C>>,
    key: u32,
}

impl<C> BreakpointGuard<C>
where
    C: Channel,
{
    /// Returns how many times this breakpoint has fired (zero once it has
    /// been unregistered or consumed).
    pub fn hits(&self) -> u64 {
        self.session
            .upgrade()
            .and_then(|inner| inner.registry.borrow().hits(self.key))
            .unwrap_or(0)
    }

    /// Unregisters the breakpoint now, surfacing channel errors.
    pub fn remove(self) -> Result<(), VmError> {
        if let Some(inner) = self.session.upgrade() {
            inner.registry.borrow_mut().remove(inner.vm.channel(), self.key)?;
        }
        std::mem::forget(self);
        Ok(())
    }

    /// Leaves the breakpoint installed for the lifetime of the session.
    pub fn keep(self) {
        std::mem::forget(self);
    }
}

impl<C> Drop for BreakpointGuard<C>
where
    C: Channel,
{
    fn drop(&mut self) {
        if let Some(inner) = self.session.upgrade()
            && let Err(err) = inner
                .registry
                .borrow_mut()
                .remove(inner.vm.channel(), self.key)
        {
            tracing::error!(%err, "failed to unregister breakpoint");
        }
    }
}

/// A guard that re-resumes the guest when dropped.
pub struct SessionPauseGuard<'a, C>
where
    C: Channel,
{
    session: &'a Session<C>,
}

impl<C> Drop for SessionPauseGuard<'_, C>
where
    C: Channel,
{
    fn drop(&mut self) {
        if let Err(err) = self.session.resume() {
            tracing::error!(%err, "failed to resume the guest");
        }
    }
}
