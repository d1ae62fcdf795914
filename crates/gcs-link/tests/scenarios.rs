use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gcs_link::command::{CommandProgress, CommandResolution};
use gcs_link::discovery::DiscoveryPhase;
use gcs_link::facts::{FactValue, MemoryFacts, NullFacts};
use gcs_link::{AckResult, CommandFailure, CommandRequest, LinkConfig, LinkEvent, Session, TransportConfig};
use gcs_proto::ids::{cmd, msg, result};
use gcs_proto::*;

const VEHICLE: u8 = 1;

fn config() -> LinkConfig {
    let mut cfg = LinkConfig::new(TransportConfig::Tcp { addr: "127.0.0.1:5760".into() });
    cfg.send_heartbeat_hz = Some(0.0);
    cfg
}

fn session() -> Session {
    Session::new(&config(), Arc::new(NullFacts))
}

fn frame(comp: u8, payload: Payload) -> Vec<u8> {
    encode(&Message::new(VEHICLE, comp, payload)).unwrap()
}

fn heartbeat(comp: u8) -> Vec<u8> {
    frame(comp, Payload::Heartbeat(HeartbeatData { mav_type: 2, autopilot: 3, ..Default::default() }))
}

fn ack(comp: u8, command: u16, result: u8) -> Vec<u8> {
    frame(
        comp,
        Payload::CommandAck(CommandAckData { command, result, target_system: 255, target_component: 190, ..Default::default() }),
    )
}

fn sent_commands(s: &mut Session) -> Vec<CommandLongData> {
    s.take_outgoing()
        .iter()
        .filter_map(|f| match decode(f) {
            Ok(Message { payload: Payload::CommandLong(c), .. }) => Some(c),
            _ => None,
        })
        .collect()
}

type Log = Arc<Mutex<Vec<CommandResolution>>>;

fn recorder(log: &Log) -> Box<dyn FnOnce(CommandResolution) + Send> {
    let log = log.clone();
    Box::new(move |r| log.lock().unwrap().push(r))
}

fn at(t0: Instant, ms: u64) -> Instant {
    t0 + Duration::from_millis(ms)
}

#[test]
fn gimbal_discovery_completes_once_in_any_order() {
    for live_first in [false, true] {
        let mut s = session();
        let mut events = s.handle().subscribe();
        let t0 = Instant::now();

        s.ingest(&heartbeat(5), t0);
        let sent = sent_commands(&mut s);
        assert_eq!(sent.len(), 1);
        assert_eq!((sent[0].command, sent[0].target_component), (cmd::REQUEST_MESSAGE, 5));
        assert_eq!(sent[0].params[0], msg::GIMBAL_MANAGER_INFORMATION as f32);
        assert_eq!(sent[0].target_system, VEHICLE);

        let info = GimbalManagerInformationData { gimbal_device_id: 6, ..Default::default() };
        s.ingest(&frame(5, Payload::GimbalManagerInformation(info)), at(t0, 10));
        let sent = sent_commands(&mut s);
        let requested: Vec<_> = sent.iter().map(|c| (c.command, c.target_component, c.params[0] as u32)).collect();
        assert_eq!(
            requested,
            vec![
                (cmd::SET_MESSAGE_INTERVAL, 5, msg::GIMBAL_MANAGER_STATUS),
                (cmd::SET_MESSAGE_INTERVAL, 6, msg::GIMBAL_DEVICE_ATTITUDE_STATUS),
            ]
        );

        let status = frame(5, Payload::GimbalManagerStatus(GimbalManagerStatusData { gimbal_device_id: 6, ..Default::default() }));
        let attitude = frame(
            6,
            Payload::GimbalDeviceAttitudeStatus(GimbalDeviceAttitudeStatusData { q: [1.0, 0.0, 0.0, 0.0], ..Default::default() }),
        );
        let (first, second) = if live_first { (&attitude, &status) } else { (&status, &attitude) };
        s.ingest(first, at(t0, 20));
        s.ingest(second, at(t0, 30));
        s.ingest(&status, at(t0, 40));
        s.ingest(&attitude, at(t0, 50));
        s.ingest(&heartbeat(5), at(t0, 60));

        let mut completions = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let LinkEvent::DiscoveryComplete { .. } = ev {
                completions.push(ev);
            }
        }
        assert_eq!(completions, vec![LinkEvent::DiscoveryComplete { component_id: 5, responsible_id: Some(6) }]);

        let snap = s.core().snapshot();
        let gimbal = snap.component(5).unwrap();
        assert_eq!(gimbal.phase, DiscoveryPhase::Complete);
        assert_eq!(gimbal.responsible_id, Some(6));
    }
}

#[test]
fn unanswered_command_is_sent_three_times_then_times_out() {
    let mut s = session();
    let t0 = Instant::now();
    s.ingest(&heartbeat(1), t0);
    s.take_outgoing();

    let log = Log::default();
    s.issue(CommandRequest::new(1, 400).max_retries(2), recorder(&log), None, t0);
    let count = |s: &mut Session| sent_commands(s).iter().filter(|c| c.command == 400).count();
    let mut sent = count(&mut s);
    for step in 1..=10 {
        s.tick(at(t0, step * 3000));
        sent += count(&mut s);
    }

    assert_eq!(sent, 3);
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].result, AckResult::CommandLevelFailure(CommandFailure::Timeout));
}

#[test]
fn zero_retries_sends_once() {
    let mut s = session();
    let t0 = Instant::now();
    let log = Log::default();
    s.issue(CommandRequest::new(1, 400).max_retries(0), recorder(&log), None, t0);
    s.tick(at(t0, 3000));
    s.tick(at(t0, 6000));

    assert_eq!(sent_commands(&mut s).len(), 1);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn in_progress_then_accepted() {
    let mut s = session();
    let t0 = Instant::now();
    s.ingest(&heartbeat(1), t0);

    let log = Log::default();
    let progress = Arc::new(Mutex::new(Vec::new()));
    let p = progress.clone();
    s.issue(
        CommandRequest::new(1, 400).max_retries(3),
        recorder(&log),
        Some(Box::new(move |pr: CommandProgress| p.lock().unwrap().push(pr.progress))),
        t0,
    );

    let mut busy = CommandAckData { command: 400, result: result::IN_PROGRESS, progress: 50, ..Default::default() };
    s.ingest(&frame(1, Payload::CommandAck(busy)), at(t0, 500));
    busy.progress = 80;
    s.ingest(&frame(1, Payload::CommandAck(busy)), at(t0, 1500));
    s.ingest(&ack(1, 400, result::ACCEPTED), at(t0, 2500));

    assert_eq!(*progress.lock().unwrap(), vec![50, 80]);
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].result, AckResult::Accepted);
    assert_eq!(log[0].transmissions, 1);
}

#[test]
fn acks_for_other_stations_are_ignored() {
    let mut s = session();
    let t0 = Instant::now();
    s.ingest(&heartbeat(1), t0);
    let log = Log::default();
    s.issue(CommandRequest::new(1, 400), recorder(&log), None, t0);

    let other = CommandAckData { command: 400, result: result::ACCEPTED, target_system: 254, target_component: 190, ..Default::default() };
    s.ingest(&frame(1, Payload::CommandAck(other)), at(t0, 10));
    assert!(log.lock().unwrap().is_empty());

    s.ingest(&ack(1, 400, result::DENIED), at(t0, 20));
    assert_eq!(log.lock().unwrap()[0].result, AckResult::Denied);
}

#[test]
fn late_drop_completion_is_published() {
    let mut s = session();
    let mut events = s.handle().subscribe();
    let t0 = Instant::now();
    s.ingest(&heartbeat(1), t0);

    let done = CommandAckData {
        command: cmd::DROP_SEQUENCE,
        result: result::ACCEPTED,
        progress: 100,
        result_param2: 99,
        target_system: 255,
        target_component: 190,
    };
    s.ingest(&frame(1, Payload::CommandAck(done)), at(t0, 10));
    s.ingest(&ack(1, 400, result::ACCEPTED), at(t0, 20));

    let late: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, LinkEvent::LateCompletion { .. }))
        .collect();
    assert_eq!(late, vec![LinkEvent::LateCompletion { component: 1, command: cmd::DROP_SEQUENCE, ack: done }]);
}

#[test]
fn locks_onto_first_vehicle_and_ignores_others() {
    let mut s = session();
    let mut events = s.handle().subscribe();
    let t0 = Instant::now();

    let gcs = Message::new(42, 190, Payload::Heartbeat(HeartbeatData { mav_type: ids::mav_type::GCS, ..Default::default() }));
    assert_eq!(s.ingest(&encode(&gcs).unwrap(), t0), 0);
    assert_eq!(s.ingest(&heartbeat(1), t0), 1);

    let stranger = Message::new(7, 1, Payload::Heartbeat(HeartbeatData { mav_type: 2, ..Default::default() }));
    assert_eq!(s.ingest(&encode(&stranger).unwrap(), t0), 0);

    let status = s.core().status().report();
    assert_eq!(status.target_system, Some(VEHICLE));
    assert_eq!(status.foreign_dropped, 2);
    assert_eq!(events.try_recv().ok(), Some(LinkEvent::TargetLocked { system_id: VEHICLE }));
}

#[test]
fn corrupt_bytes_do_not_stop_the_link() {
    let mut s = session();
    let t0 = Instant::now();

    let mut bad = heartbeat(1);
    bad[12] ^= 0x10;
    let mut stream = vec![0x55, 0xAA];
    stream.extend_from_slice(&bad);
    stream.extend_from_slice(&heartbeat(1));

    // Arbitrary chunking.
    let mut dispatched = 0;
    for chunk in stream.chunks(5) {
        dispatched += s.ingest(chunk, t0);
    }
    assert_eq!(dispatched, 1);
    let status = s.core().status().report();
    assert!(status.decode_errors >= 1);
    assert_eq!(status.messages_in, 1);
}

#[test]
fn battery_and_vehicle_facts() {
    let facts = Arc::new(MemoryFacts::new());
    let mut s = Session::new(&config(), facts.clone());
    let t0 = Instant::now();

    let armed = HeartbeatData { mav_type: 2, base_mode: ids::mode_flag::SAFETY_ARMED, custom_mode: 4, ..Default::default() };
    s.ingest(&frame(1, Payload::Heartbeat(armed)), t0);
    let status = SysStatusData { voltage_battery: 16_000, current_battery: -1, battery_remaining: 55, ..Default::default() };
    s.ingest(&frame(1, Payload::SysStatus(status)), t0);

    assert_eq!(facts.get("vehicle.armed"), Some(FactValue::Bool(true)));
    assert_eq!(facts.get("vehicle.custom_mode"), Some(FactValue::Int(4)));
    assert_eq!(facts.get("battery.voltage_v"), Some(FactValue::Float(16.0)));
    assert_eq!(facts.get("battery.current_a"), None);
    assert_eq!(facts.get("battery.remaining_pct"), Some(FactValue::Int(55)));
}

#[test]
fn status_request_falls_back_to_fixed_rate_on_last_attempt() {
    let mut cfg = config();
    cfg.discovery.status_retries = 2;
    let mut s = Session::new(&cfg, Arc::new(NullFacts));
    let t0 = Instant::now();

    let mut intervals = Vec::new();
    for i in 0..5 {
        s.ingest(&heartbeat(5), at(t0, i * 1000));
        intervals.extend(
            sent_commands(&mut s)
                .into_iter()
                .filter(|c| c.command == cmd::SET_MESSAGE_INTERVAL)
                .map(|c| c.params[1]),
        );
    }
    assert_eq!(intervals, vec![0.0, 5_000_000.0]);
}
