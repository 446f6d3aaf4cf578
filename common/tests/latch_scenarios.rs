use std::{sync::Arc, thread};

use pretty_assertions::assert_eq;

use latch_common::{
    command_inbox, restore_state, ActuatorAction, AlarmSequence, CloudBridge, CommandSender,
    IndicatorColor, InputSample, LatchConfig, LatchEngine, LatchEvent, LockSource, LockStore,
    MemoryLockStore, StateStore, Topics, LOCKED_KEY,
};

struct Rig {
    engine: LatchEngine<MemoryLockStore>,
    bridge: CloudBridge,
    state: Arc<StateStore>,
}

fn rig(persisted_locked: bool, door_closed: bool) -> Rig {
    let config = LatchConfig::default();
    let persistence = MemoryLockStore::with_value(LOCKED_KEY, persisted_locked);
    let state = Arc::new(StateStore::new(restore_state(&persistence, door_closed)));
    let (sender, receiver) = command_inbox(config.inbox_capacity);
    let engine = LatchEngine::new(&config, Arc::clone(&state), receiver, persistence);
    Rig {
        engine,
        bridge: CloudBridge::new(Topics::default(), sender),
        state,
    }
}

fn inputs(door_closed: bool, toggle_pressed: bool) -> InputSample {
    InputSample {
        door_closed,
        toggle_pressed,
        bell_pressed: false,
    }
}

fn payload(locked: bool) -> &'static [u8] {
    if locked {
        b"true"
    } else {
        b"false"
    }
}

#[test]
fn boot_locked_with_door_open_starts_alarm() {
    let mut rig = rig(true, false);

    let actions = rig.engine.start(0);

    let state = rig.state.read();
    assert!(state.locked());
    assert!(state.alarm_active());
    assert_eq!(actions.first(), Some(&ActuatorAction::MoveServo(90)));
    assert!(matches!(
        rig.engine.actuators().alarm(),
        AlarmSequence::Blinking { .. }
    ));

    let _ = rig.engine.tick(inputs(false, false), 300);
    assert_eq!(
        rig.engine.actuators().frame().indicator,
        Some(IndicatorColor::Red)
    );
}

#[test]
fn remote_unlock_reaches_servo_indicator_and_storage() {
    let mut rig = rig(true, true);
    let _ = rig.engine.start(0);
    assert_eq!(
        rig.engine.actuators().frame().indicator,
        Some(IndicatorColor::Red)
    );

    rig.bridge.handle_control(b"false").unwrap();
    let tick = rig.engine.tick(inputs(true, false), 10);

    assert_eq!(
        tick.events,
        vec![LatchEvent::LockChanged {
            locked: false,
            source: LockSource::Remote,
        }]
    );
    let frame = rig.engine.actuators().frame();
    assert_eq!(frame.servo_angle, Some(0));
    assert_eq!(frame.indicator, Some(IndicatorColor::Green));
    assert!(!rig.engine.persistence().get_bool(LOCKED_KEY, true));
}

#[test]
fn command_applies_before_manual_toggle_in_same_tick() {
    let mut rig = rig(false, true);
    let _ = rig.engine.start(0);

    rig.bridge.handle_control(b"true").unwrap();
    let tick = rig.engine.tick(inputs(true, true), 10);

    assert_eq!(
        tick.events,
        vec![
            LatchEvent::LockChanged {
                locked: true,
                source: LockSource::Remote,
            },
            LatchEvent::LockChanged {
                locked: false,
                source: LockSource::Manual,
            },
        ]
    );
    assert!(!rig.state.read().locked());
    assert!(!rig.engine.persistence().get_bool(LOCKED_KEY, true));
}

#[test]
fn overflowing_inbox_drops_newest_and_keeps_running() {
    let mut rig = rig(false, true);

    let accepted = [true, false, true, false, true, false]
        .into_iter()
        .map(|locked| rig.bridge.handle_control(payload(locked)))
        .filter(Result::is_ok)
        .count();
    assert_eq!(accepted, 5);

    let applied: Vec<bool> = (0..6)
        .map(|step| {
            let _ = rig.engine.tick(inputs(true, false), step * 10);
            rig.state.read().locked()
        })
        .collect();

    assert_eq!(applied, vec![true, false, true, false, true, true]);
}

#[test]
fn alarm_invariant_holds_across_mixed_inputs() {
    let mut rig = rig(false, true);

    for step in 0..400_u64 {
        let door_closed = (step / 37) % 2 == 0;
        let toggle = step % 29 == 0;
        if step % 53 == 0 {
            let _ = rig.bridge.handle_control(payload(step % 2 == 0));
        }

        let tick = rig.engine.tick(inputs(door_closed, toggle), step * 10);
        let state = rig.state.read();
        assert_eq!(state.alarm_active(), state.locked() && !state.door_closed());

        let blinking = matches!(
            rig.engine.actuators().alarm(),
            AlarmSequence::Blinking { .. }
        );
        assert_eq!(blinking, state.alarm_active(), "tick {step}: {tick:?}");
    }
}

#[test]
fn network_thread_commands_are_applied_by_hardware_loop() {
    let config = LatchConfig::default();
    let state = Arc::new(StateStore::default());
    let (sender, receiver) = command_inbox(config.inbox_capacity);
    let mut engine = LatchEngine::new(
        &config,
        Arc::clone(&state),
        receiver,
        MemoryLockStore::default(),
    );

    let network = spawn_network(sender, Arc::clone(&state));
    let snapshots = network.join().unwrap();

    for step in 0..5 {
        let _ = engine.tick(inputs(true, false), step * 10);
    }

    assert!(state.read().locked());
    assert!(snapshots
        .iter()
        .all(|(locked, door_closed, alarm)| *alarm == (*locked && !*door_closed)));
}

fn spawn_network(
    sender: CommandSender,
    state: Arc<StateStore>,
) -> thread::JoinHandle<Vec<(bool, bool, bool)>> {
    thread::spawn(move || {
        let bridge = CloudBridge::new(Topics::default(), sender);
        let mut snapshots = Vec::new();
        for _ in 0..3 {
            let _ = bridge.handle_control(b"true");
            let snapshot = state.read();
            snapshots.push((
                snapshot.locked(),
                snapshot.door_closed(),
                snapshot.alarm_active(),
            ));
        }
        snapshots
    })
}
