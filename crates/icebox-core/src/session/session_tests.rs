use std::{cell::RefCell, rc::Rc, time::Duration};

use crate::{
    arch::Registers,
    os::ThreadObject,
    testkit::MockChannel,
    Breakpoint, BreakpointKind, Pa, RunControl, RunOutcome, RunState, Session, Va, VcpuId, VmEvent,
    VmEventKind,
};

const TEXT: Pa = Pa(0x5000);

fn breakpoint_event(pa: Pa, rbx: u64) -> VmEvent {
    let registers = Registers {
        rbx,
        rip: 0xFFFF_8000_0000_1000,
        ..Default::default()
    };

    VmEvent::new(VcpuId(0), registers, VmEventKind::Breakpoint { pa })
}

fn session_with_code() -> Session<MockChannel> {
    let channel = MockChannel::new();
    channel.write_bytes(TEXT, &[0x48, 0x89, 0x5c, 0x24, 0x08]);
    Session::attach(channel).unwrap()
}

#[test]
fn attach_pauses_the_guest() {
    let session = session_with_code();
    assert_eq!(session.state(), RunState::Paused);
    assert!(session.vm().channel().is_paused());
}

#[test]
fn breakpoint_byte_round_trip() {
    let session = session_with_code();
    let original = session.vm().channel().read_byte(TEXT);

    let guard = session
        .insert_breakpoint(Breakpoint::new(TEXT), |_, _| RunControl::Continue)
        .unwrap();

    assert_eq!(session.vm().channel().read_byte(TEXT), 0xcc);

    drop(guard);
    assert_eq!(session.vm().channel().read_byte(TEXT), original);
    assert_eq!(session.vm().channel().breakpoint_count(), 0);
}

#[test]
fn logical_breakpoints_share_one_slot() {
    let session = session_with_code();

    let first = session
        .insert_breakpoint(Breakpoint::new(TEXT), |_, _| RunControl::Continue)
        .unwrap();
    let second = session
        .insert_breakpoint(Breakpoint::new(TEXT), |_, _| RunControl::Continue)
        .unwrap();

    assert_eq!(session.vm().channel().breakpoint_count(), 1);
    assert_eq!(session.breakpoints_at(TEXT), 2);

    drop(first);
    assert_eq!(session.vm().channel().breakpoint_count(), 1);
    assert_eq!(session.vm().channel().read_byte(TEXT), 0xcc);

    drop(second);
    assert_eq!(session.vm().channel().breakpoint_count(), 0);
    assert_eq!(session.vm().channel().read_byte(TEXT), 0x48);
}

#[test]
fn incompatible_kind_at_same_address_is_rejected() {
    let session = session_with_code();

    let _guard = session
        .insert_breakpoint(Breakpoint::new(TEXT), |_, _| RunControl::Continue)
        .unwrap();

    let result = session.insert_breakpoint(
        Breakpoint::new(TEXT).kind(BreakpointKind::Write),
        |_, _| RunControl::Continue,
    );

    assert!(matches!(
        result,
        Err(crate::VmError::BreakpointConflict(pa)) if pa == TEXT
    ));
}

#[test]
fn callbacks_fire_in_registration_order() {
    let session = session_with_code();
    let order = Rc::new(RefCell::new(Vec::new()));

    let mut guards = Vec::new();
    for tag in ["first", "second", "third"] {
        let order = order.clone();
        guards.push(
            session
                .insert_breakpoint(Breakpoint::new(TEXT), move |_, _| {
                    order.borrow_mut().push(tag);
                    RunControl::Continue
                })
                .unwrap(),
        );
    }

    session.vm().channel().push_event(breakpoint_event(TEXT, 0));
    let outcome = session
        .run_until(Duration::from_millis(10), |_| true)
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Event(_)));
    assert_eq!(*order.borrow(), ["first", "second", "third"]);
    assert_eq!(session.state(), RunState::Paused);
}

#[test]
fn one_shot_is_consumed_before_its_callback_runs() {
    let session = session_with_code();
    let hits = Rc::new(RefCell::new(0u32));

    {
        let session_inner = session.clone();
        let hits = hits.clone();
        session
            .insert_breakpoint(Breakpoint::new(TEXT).one_shot(), move |_, _| {
                // The entry is already gone when the callback runs.
                assert_eq!(session_inner.breakpoints_at(TEXT), 0);
                *hits.borrow_mut() += 1;
                RunControl::Continue
            })
            .unwrap()
            .keep();
    }

    session.vm().channel().push_event(breakpoint_event(TEXT, 0));
    session.vm().channel().push_event(breakpoint_event(TEXT, 0));
    session
        .run_until(Duration::from_millis(10), |_| false)
        .ok();

    // The second event found no logical entry.
    assert_eq!(*hits.borrow(), 1);
    assert_eq!(session.vm().channel().breakpoint_count(), 0);
}

#[test]
fn one_shot_callback_can_rearm_itself() {
    let session = session_with_code();
    let hits = Rc::new(RefCell::new(0u32));

    fn arm(session: &Session<MockChannel>, hits: Rc<RefCell<u32>>) {
        let rearm = session.clone();
        session
            .insert_breakpoint(Breakpoint::new(TEXT).one_shot(), move |_, _| {
                *hits.borrow_mut() += 1;
                if *hits.borrow() < 2 {
                    arm(&rearm, hits.clone());
                }
                RunControl::Continue
            })
            .unwrap()
            .keep();
    }

    arm(&session, hits.clone());

    session.vm().channel().push_event(breakpoint_event(TEXT, 0));
    session.vm().channel().push_event(breakpoint_event(TEXT, 0));
    session
        .run_until(Duration::from_millis(10), |_| false)
        .ok();

    assert_eq!(*hits.borrow(), 2);
}

#[test]
fn thread_filter_matches_the_resolved_thread() {
    let session = session_with_code();

    // Thread identity comes from the OS layer; here it is scripted through
    // RBX so each event can carry its own thread.
    session.set_thread_resolver(Box::new(|_, event| {
        Some(ThreadObject(Va(event.registers().rbx)))
    }));

    let hits = Rc::new(RefCell::new(Vec::new()));

    for thread in [0x1000u64, 0x2000] {
        let hits = hits.clone();
        session
            .insert_breakpoint(
                Breakpoint::new(TEXT).thread(ThreadObject(Va(thread))),
                move |_, event| {
                    hits.borrow_mut().push(event.registers().rbx);
                    RunControl::Continue
                },
            )
            .unwrap()
            .keep();
    }

    session
        .vm()
        .channel()
        .push_event(breakpoint_event(TEXT, 0x2000));
    session
        .run_until(Duration::from_millis(10), |_| true)
        .unwrap();

    assert_eq!(*hits.borrow(), [0x2000]);
}

#[test]
fn stop_from_a_callback_drains_remaining_callbacks_first() {
    let session = session_with_code();
    let order = Rc::new(RefCell::new(Vec::new()));

    {
        let order = order.clone();
        session
            .insert_breakpoint(Breakpoint::new(TEXT), move |_, _| {
                order.borrow_mut().push("stopper");
                RunControl::Stop
            })
            .unwrap()
            .keep();
    }
    {
        let order = order.clone();
        session
            .insert_breakpoint(Breakpoint::new(TEXT), move |_, _| {
                order.borrow_mut().push("after");
                RunControl::Continue
            })
            .unwrap()
            .keep();
    }

    session.vm().channel().push_event(breakpoint_event(TEXT, 0));
    let outcome = session
        .run_until(Duration::from_millis(10), |_| false)
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Event(_)));
    assert_eq!(*order.borrow(), ["stopper", "after"]);
}

#[test]
fn hit_counts_accumulate_per_logical_entry() {
    let session = session_with_code();

    let guard = session
        .insert_breakpoint(Breakpoint::new(TEXT), |_, _| RunControl::Continue)
        .unwrap();

    assert_eq!(guard.hits(), 0);

    session.vm().channel().push_event(breakpoint_event(TEXT, 0));
    session.vm().channel().push_event(breakpoint_event(TEXT, 0));
    session
        .run_until(Duration::from_millis(10), |_| false)
        .ok();

    assert_eq!(guard.hits(), 2);
}

#[test]
fn timeout_is_surfaced_to_the_caller() {
    let session = session_with_code();

    let outcome = session
        .run_until(Duration::from_millis(1), |_| true)
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Timeout));
    assert_eq!(session.state(), RunState::Paused);
    assert!(session.vm().channel().is_paused());
}

#[test]
fn detach_restores_every_byte_and_invalidates_the_session() {
    let session = session_with_code();

    session
        .insert_breakpoint(Breakpoint::new(TEXT), |_, _| RunControl::Continue)
        .unwrap()
        .keep();
    session
        .insert_breakpoint(Breakpoint::new(TEXT + 2), |_, _| RunControl::Continue)
        .unwrap()
        .keep();

    session.detach().unwrap();

    assert_eq!(session.state(), RunState::Detached);
    assert_eq!(session.vm().channel().breakpoint_count(), 0);
    assert_eq!(session.vm().channel().read_byte(TEXT), 0x48);
    assert_eq!(session.vm().channel().read_byte(TEXT + 2), 0x5c);
    assert!(!session.vm().channel().is_paused());

    assert!(matches!(
        session.resume(),
        Err(crate::VmError::InvalidRunState { .. })
    ));
}

#[test]
fn step_once_keeps_the_session_paused() {
    let session = session_with_code();

    session.vm().channel().push_event(VmEvent::new(
        VcpuId(0),
        Registers::default(),
        VmEventKind::Singlestep,
    ));

    let event = session.step_once(VcpuId(0)).unwrap();

    assert_eq!(event.kind(), VmEventKind::Singlestep);
    assert_eq!(session.state(), RunState::Paused);
    assert_eq!(session.vm().channel().singlestep_log(), [VcpuId(0)]);
}
