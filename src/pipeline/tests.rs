use super::*;
use crate::bus::{ControlCommand, Frame, Payload};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::atomic::AtomicUsize;
use std::thread;
use std::time::Instant;

const WAIT: Duration = Duration::from_secs(2);

/// Forwards every frame downstream unchanged.
struct Relay;

impl Stage for Relay {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn process_frame(&self, frame: Frame, link: &StageLink) -> Result<(), PipelineError> {
        link.send_downstream(frame);
        Ok(())
    }
}

/// Records what it handles. The first data frame parks until `release` is called.
struct Tap {
    log: Mutex<Vec<String>>,
    threads: Mutex<Vec<String>>,
    entered_tx: Sender<()>,
    entered_rx: Receiver<()>,
    gate_tx: Sender<()>,
    gate_rx: Receiver<()>,
    park_first_data: bool,
    parked: AtomicBool,
    stops: AtomicUsize,
}

impl Tap {
    fn new(park_first_data: bool) -> Self {
        let (entered_tx, entered_rx) = unbounded();
        let (gate_tx, gate_rx) = bounded(1);
        Self {
            log: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            entered_tx,
            entered_rx,
            gate_tx,
            gate_rx,
            park_first_data,
            parked: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
        }
    }

    fn release(&self) {
        let _ = self.gate_tx.send(());
    }

    fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn wait_for_entries(&self, count: usize) -> Vec<String> {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            let entries = self.entries();
            if entries.len() >= count {
                return entries;
            }
            thread::sleep(Duration::from_millis(5));
        }
        self.entries()
    }
}

impl Stage for Tap {
    fn name(&self) -> &'static str {
        "tap"
    }

    fn process_frame(&self, frame: Frame, _link: &StageLink) -> Result<(), PipelineError> {
        let entry = match frame.payload() {
            Payload::CapturedAudio(samples) => format!("data{}", samples.len()),
            other => other.label().to_string(),
        };
        let is_data = matches!(frame.payload(), Payload::CapturedAudio(_));
        self.log.lock().unwrap().push(entry.clone());
        self.threads.lock().unwrap().push(
            thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_string(),
        );
        let _ = self.entered_tx.send(());
        if is_data && self.park_first_data && !self.parked.swap(true, Ordering::SeqCst) {
            let _ = self.gate_rx.recv_timeout(WAIT);
        }
        Ok(())
    }

    fn on_stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn audio(len: usize) -> Frame {
    Frame::data(Payload::CapturedAudio(vec![0.0; len]))
}

#[test]
fn start_delivers_begin_to_first_stage() {
    let tap = Arc::new(Tap::new(false));
    let pipeline = Pipeline::new(vec![tap.clone() as Arc<dyn Stage>]);
    pipeline.start().unwrap();
    assert_eq!(tap.entries(), vec!["begin"]);
    assert_eq!(pipeline.state(), TurnState::Listening);
}

#[test]
fn immediate_frames_overtake_queued_data() {
    let tap = Arc::new(Tap::new(true));
    let pipeline = Pipeline::new(vec![Arc::new(Relay) as Arc<dyn Stage>, tap.clone()]);
    pipeline.start().unwrap();
    tap.entered_rx.recv_timeout(WAIT).expect("begin handled");

    for len in 1..=3 {
        pipeline.send(audio(len));
    }
    tap
        .entered_rx
        .recv_timeout(WAIT)
        .expect("first data frame reached the tap");
    pipeline.interrupt();
    tap.release();

    let entries = tap.wait_for_entries(5);
    assert_eq!(entries, vec!["begin", "data1", "interrupt", "data2", "data3"]);

    let threads = tap.threads.lock().unwrap().clone();
    assert!(threads[1].starts_with("voxduplex-stage-tap"));
    assert!(!threads[2].starts_with("voxduplex-stage"));
}

#[test]
fn handler_errors_and_panics_do_not_stop_the_worker() {
    struct Flaky {
        seen: AtomicUsize,
        done: Sender<usize>,
    }

    impl Stage for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn process_frame(&self, frame: Frame, _link: &StageLink) -> Result<(), PipelineError> {
            if !matches!(frame.payload(), Payload::CapturedAudio(_)) {
                return Ok(());
            }
            match self.seen.fetch_add(1, Ordering::SeqCst) {
                0 => Err(PipelineError::Classifier("bad frame".to_string())),
                1 => panic!("handler blew up"),
                n => {
                    let _ = self.done.send(n);
                    Ok(())
                }
            }
        }
    }

    let (done, done_rx) = unbounded();
    let pipeline = Pipeline::new(vec![Arc::new(Flaky {
        seen: AtomicUsize::new(0),
        done,
    }) as Arc<dyn Stage>]);
    pipeline.start().unwrap();
    for len in 1..=3 {
        pipeline.send(audio(len));
    }
    assert_eq!(done_rx.recv_timeout(WAIT).unwrap(), 2);
}

#[test]
fn stop_is_idempotent_and_reports_idle() {
    let (observer, states) = ChannelObserver::new(8);
    let tap = Arc::new(Tap::new(false));
    let pipeline = Pipeline::new(vec![tap.clone() as Arc<dyn Stage>]);
    pipeline.add_observer(observer);

    pipeline.start().unwrap();
    pipeline.start().unwrap();
    pipeline.stop();
    pipeline.stop();

    let seen: Vec<TurnState> = states.try_iter().collect();
    assert_eq!(seen, vec![TurnState::Listening, TurnState::Idle]);
    assert_eq!(tap.stops.load(Ordering::SeqCst), 1);
    assert!(!pipeline.is_running());
    assert!(pipeline.context().is_cancelled());
}

#[test]
fn frames_sent_while_stopped_are_dropped() {
    let tap = Arc::new(Tap::new(false));
    let pipeline = Pipeline::new(vec![tap.clone() as Arc<dyn Stage>]);
    pipeline.send(Frame::immediate(Payload::Control(ControlCommand::Interrupt)));
    assert!(tap.entries().is_empty());
}

#[test]
fn events_leaving_the_first_stage_reach_subscribers() {
    struct Announcer;

    impl Stage for Announcer {
        fn name(&self) -> &'static str {
            "announcer"
        }

        fn process_frame(&self, frame: Frame, link: &StageLink) -> Result<(), PipelineError> {
            if matches!(frame.payload(), Payload::Control(ControlCommand::Begin)) {
                link.send_upstream(Frame::event(PipelineEvent::SpeechStarted { frame_index: 7 }));
            }
            Ok(())
        }
    }

    let pipeline = Pipeline::new(vec![Arc::new(Announcer) as Arc<dyn Stage>]);
    let events = pipeline.subscribe(4);
    pipeline.start().unwrap();
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        PipelineEvent::SpeechStarted { frame_index: 7 }
    );
    assert_eq!(pipeline.state(), TurnState::UserSpeaking);
}

#[test]
fn stop_abandons_a_stuck_worker_after_the_join_timeout() {
    struct Stuck {
        entered: Sender<()>,
    }

    impl Stage for Stuck {
        fn name(&self) -> &'static str {
            "stuck"
        }

        fn process_frame(&self, frame: Frame, _link: &StageLink) -> Result<(), PipelineError> {
            if matches!(frame.payload(), Payload::CapturedAudio(_)) {
                let _ = self.entered.send(());
                thread::sleep(Duration::from_millis(1500));
            }
            Ok(())
        }
    }

    let (entered, entered_rx) = unbounded();
    let pipeline = Pipeline::new(vec![Arc::new(Stuck { entered }) as Arc<dyn Stage>])
        .with_join_timeout(Duration::from_millis(100));
    pipeline.start().unwrap();
    pipeline.send(audio(1));
    pipeline.send(audio(2));
    entered_rx.recv_timeout(WAIT).unwrap();

    let started = Instant::now();
    pipeline.stop();
    assert!(started.elapsed() < Duration::from_millis(1000));
}

#[test]
fn session_context_is_shared_by_all_links() {
    struct Bumper;

    impl Stage for Bumper {
        fn name(&self) -> &'static str {
            "bumper"
        }

        fn process_frame(&self, frame: Frame, link: &StageLink) -> Result<(), PipelineError> {
            if matches!(frame.payload(), Payload::Control(ControlCommand::Interrupt)) {
                link.context().bump_session();
            }
            Ok(())
        }
    }

    let pipeline = Pipeline::new(vec![Arc::new(Bumper) as Arc<dyn Stage>]);
    pipeline.start().unwrap();
    pipeline.interrupt();
    pipeline.interrupt();
    assert_eq!(pipeline.context().current_session(), 2);
}

#[test]
fn restart_leaves_an_abandoned_worker_stopped() {
    struct Sleeper {
        entered: Sender<()>,
        first: AtomicBool,
        handled_by: Mutex<Vec<thread::ThreadId>>,
    }

    impl Stage for Sleeper {
        fn name(&self) -> &'static str {
            "sleeper"
        }

        fn process_frame(&self, frame: Frame, _link: &StageLink) -> Result<(), PipelineError> {
            if !matches!(frame.payload(), Payload::CapturedAudio(_)) {
                return Ok(());
            }
            if !self.first.swap(true, Ordering::SeqCst) {
                let _ = self.entered.send(());
                thread::sleep(Duration::from_millis(400));
                return Ok(());
            }
            self.handled_by.lock().unwrap().push(thread::current().id());
            thread::sleep(Duration::from_millis(5));
            Ok(())
        }
    }

    let (entered, entered_rx) = unbounded();
    let stage = Arc::new(Sleeper {
        entered,
        first: AtomicBool::new(false),
        handled_by: Mutex::new(Vec::new()),
    });
    let pipeline = Pipeline::new(vec![stage.clone() as Arc<dyn Stage>])
        .with_join_timeout(Duration::from_millis(100));
    pipeline.start().unwrap();
    pipeline.send(audio(1));
    entered_rx.recv_timeout(WAIT).unwrap();

    pipeline.stop();
    pipeline.start().unwrap();
    assert_eq!(pipeline.context().current_session(), 1);

    // Let the abandoned worker wake from its handler, then keep the queue busy.
    thread::sleep(Duration::from_millis(450));
    for len in 0..20 {
        pipeline.send(audio(len + 2));
    }
    let deadline = Instant::now() + WAIT;
    while stage.handled_by.lock().unwrap().len() < 20 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    let handled_by = stage.handled_by.lock().unwrap().clone();
    assert_eq!(handled_by.len(), 20);
    assert!(handled_by.iter().all(|id| *id == handled_by[0]));
    pipeline.stop();
}
