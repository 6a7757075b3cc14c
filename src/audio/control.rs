//! Control-thread side of the realtime recorder: sends take commands,
//! waits for acknowledgements and reacts to stream faults.

use log::{debug, info, warn};
use rtrb::{Consumer, Producer, PushError};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::callback::{RtCommand, RtEvent, StreamFault};
use crate::error::TakeError;
use crate::session::SessionClock;
use crate::store::{Take, TakeStore};
use crate::types::SessionState;

/// How long the control thread waits for the callback to acknowledge a command
const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Watches the stream error callbacks
#[derive(Debug, Default)]
pub struct FaultMonitor {
    faults: Option<Receiver<StreamFault>>,
}

impl FaultMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, faults: Receiver<StreamFault>) {
        self.faults = Some(faults);
    }

    pub fn detach(&mut self) {
        self.faults = None;
    }

    /// Reason of the first fatal fault, if one arrived. Non-fatal faults are
    /// only logged. After a fatal fault the monitor detaches, so the loss is
    /// reported once.
    pub fn check(&mut self) -> Option<String> {
        loop {
            let faults = self.faults.as_ref()?;
            match faults.try_recv() {
                Ok(fault) if fault.fatal => {
                    self.faults = None;
                    return Some(fault.message);
                }
                Ok(fault) => warn!("Audio stream error: {}", fault.message),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    self.faults = None;
                    return None;
                }
            }
        }
    }
}

/// Drives takes through a running recorder. `S` owns whatever keeps the
/// recorder alive; dropping it drops the recorder and any take it holds.
pub struct TakeControl<S> {
    store: TakeStore,
    clock: Arc<SessionClock>,
    streams: Option<S>,

    /// Control thread -> callback
    commands: Option<Producer<RtCommand>>,
    /// Callback -> control thread
    events: Option<Consumer<RtEvent>>,
    faults: FaultMonitor,

    state: SessionState,
}

impl<S> TakeControl<S> {
    pub fn new(store: TakeStore, clock: Arc<SessionClock>) -> Self {
        Self {
            store,
            clock,
            streams: None,
            commands: None,
            events: None,
            faults: FaultMonitor::new(),
            state: SessionState::Idle,
        }
    }

    /// Take over a running recorder
    pub fn connect(
        &mut self,
        streams: S,
        commands: Producer<RtCommand>,
        events: Consumer<RtEvent>,
        faults: Receiver<StreamFault>,
    ) {
        self.streams = Some(streams);
        self.commands = Some(commands);
        self.events = Some(events);
        self.faults.attach(faults);
    }

    /// Abort any running take and hand the streams back
    pub fn disconnect(&mut self) -> Option<S> {
        if self.state == SessionState::Recording {
            if let Err(e) = self.abort() {
                warn!("Failed to abort take while stopping stream: {}", e);
            }
        }

        let streams = self.streams.take();
        self.release_rings();
        streams
    }

    pub fn is_connected(&self) -> bool {
        self.streams.is_some()
    }

    /// Start capturing a new take
    pub fn begin_take(&mut self, name: &str) -> Result<(), TakeError> {
        if self.state == SessionState::Recording {
            return Err(TakeError::AlreadyRecording);
        }
        self.check_faults()?;

        let commands = self
            .commands
            .as_mut()
            .ok_or(TakeError::InvalidState("audio stream is not running"))?;

        let take = self.store.begin_take(name)?;
        if let Err(PushError::Full(command)) = commands.push(RtCommand::Begin(take)) {
            drop(command);
            return Err(TakeError::InvalidState("command queue is full"));
        }

        loop {
            match self.wait_event()? {
                RtEvent::Started => {
                    self.state = SessionState::Recording;
                    info!("Recording take '{}'", name);
                    return Ok(());
                }
                RtEvent::Rejected { take } => {
                    take.abort();
                    return Err(TakeError::AlreadyRecording);
                }
                other => self.discard_stray(other),
            }
        }
    }

    /// Stop the running take and add it to the store
    pub fn commit(&mut self) -> Result<Take, TakeError> {
        if self.state != SessionState::Recording {
            return Err(TakeError::InvalidState("no take in progress"));
        }
        self.send(RtCommand::Stop)?;

        loop {
            match self.wait_event()? {
                RtEvent::Stopped { take, final_frame } => {
                    self.state = SessionState::Idle;
                    debug!("Take stopped at frame {}", final_frame);
                    let take = take.commit()?;
                    info!("Committed take {} '{}'", take.id(), take.name());
                    return Ok(take);
                }
                RtEvent::Overrun { take, dropped } => {
                    self.state = SessionState::Idle;
                    take.abort();
                    return Err(TakeError::BufferOverrun { dropped });
                }
                RtEvent::Idle => {
                    self.state = SessionState::Idle;
                    return Err(TakeError::InvalidState("no take in progress"));
                }
                other => self.discard_stray(other),
            }
        }
    }

    /// Stop the running take and throw it away
    pub fn abort(&mut self) -> Result<(), TakeError> {
        if self.state != SessionState::Recording {
            return Err(TakeError::InvalidState("no take in progress"));
        }
        self.send(RtCommand::Abort)?;

        loop {
            match self.wait_event()? {
                RtEvent::Aborted { take } | RtEvent::Overrun { take, .. } => {
                    self.state = SessionState::Idle;
                    take.abort();
                    info!("Take aborted");
                    return Ok(());
                }
                RtEvent::Idle => {
                    self.state = SessionState::Idle;
                    return Ok(());
                }
                other => self.discard_stray(other),
            }
        }
    }

    /// Check for asynchronous failures. Call periodically from the control
    /// loop; each failure is reported exactly once.
    pub fn poll(&mut self) -> Option<TakeError> {
        if let Err(e) = self.check_faults() {
            return Some(e);
        }

        let event = self.events.as_mut().and_then(|events| events.pop().ok())?;
        match event {
            RtEvent::Overrun { take, dropped } => {
                self.state = SessionState::Idle;
                take.abort();
                warn!("Take discarded after buffer overrun ({} samples dropped)", dropped);
                Some(TakeError::BufferOverrun { dropped })
            }
            other => {
                self.discard_stray(other);
                None
            }
        }
    }

    fn send(&mut self, command: RtCommand) -> Result<(), TakeError> {
        let commands = self
            .commands
            .as_mut()
            .ok_or(TakeError::InvalidState("audio stream is not running"))?;
        commands
            .push(command)
            .map_err(|_| TakeError::InvalidState("command queue is full"))
    }

    /// Wait for the next callback event. A fatal stream fault or an
    /// unresponsive callback tears the streams down and loses the take.
    fn wait_event(&mut self) -> Result<RtEvent, TakeError> {
        let deadline = Instant::now() + ACK_TIMEOUT;
        loop {
            if let Some(event) = self.events.as_mut().and_then(|events| events.pop().ok()) {
                return Ok(event);
            }
            self.check_faults()?;
            if Instant::now() >= deadline {
                return Err(self.lose_input("audio callback stopped responding".to_string()));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn check_faults(&mut self) -> Result<(), TakeError> {
        match self.faults.check() {
            Some(reason) => Err(self.lose_input(reason)),
            None => Ok(()),
        }
    }

    /// Drop the streams after the device went away. Dropping them drops the
    /// recorder with any take it holds, which discards it.
    fn lose_input(&mut self, reason: String) -> TakeError {
        warn!("Audio input lost: {}", reason);
        self.streams = None;
        self.release_rings();
        self.state = SessionState::Idle;
        TakeError::InputLost(reason)
    }

    fn release_rings(&mut self) {
        self.commands = None;
        self.faults.detach();
        if let Some(mut events) = self.events.take() {
            while let Ok(event) = events.pop() {
                self.discard_stray(event);
            }
        }
        self.clock.stop();
    }

    fn discard_stray(&self, event: RtEvent) {
        match event {
            RtEvent::Stopped { take, .. }
            | RtEvent::Aborted { take }
            | RtEvent::Overrun { take, .. }
            | RtEvent::Rejected { take } => {
                debug!("Discarding take '{}' from stale event", take.name());
                take.abort();
            }
            RtEvent::Started | RtEvent::Idle => {}
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn store(&self) -> &TakeStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::callback::{InputControls, RealtimeRecorder};
    use crate::session::PunchWindowTracker;
    use crate::store::{MemoryBackend, StoreOptions, TakeFormat};
    use parking_lot::Mutex;
    use std::sync::mpsc::{self, Sender};
    use std::thread;

    /// Stands in for the device streams: a thread plays the callback until
    /// this is dropped, and dropping it drops the recorder.
    struct FakeStreams {
        recorder: Arc<Mutex<Option<RealtimeRecorder>>>,
    }

    impl Drop for FakeStreams {
        fn drop(&mut self) {
            self.recorder.lock().take();
        }
    }

    struct Rig {
        control: TakeControl<FakeStreams>,
        faults: Sender<StreamFault>,
        backend: MemoryBackend,
        callback: thread::JoinHandle<()>,
    }

    fn rig() -> Rig {
        let backend = MemoryBackend::new();
        let store = TakeStore::new(
            Arc::new(backend.clone()),
            StoreOptions {
                format: TakeFormat::new(48000, 1),
                ring_seconds: 1,
            },
        );
        let clock = Arc::new(SessionClock::new(48000));
        let (command_tx, command_rx) = rtrb::RingBuffer::new(4);
        let (event_tx, event_rx) = rtrb::RingBuffer::new(4);
        let (monitor_tx, _monitor_rx) = rtrb::RingBuffer::new(16);
        let (fault_tx, fault_rx) = mpsc::channel();

        let recorder = RealtimeRecorder::new(
            clock.clone(),
            Arc::new(PunchWindowTracker::new()),
            Arc::new(InputControls::new()),
            None,
            command_rx,
            event_tx,
            monitor_tx,
            1,
        );
        let recorder = Arc::new(Mutex::new(Some(recorder)));

        let callback = {
            let recorder = recorder.clone();
            thread::spawn(move || loop {
                match recorder.lock().as_mut() {
                    Some(recorder) => recorder.process_input(&[0.1; 16]),
                    None => return,
                }
                thread::sleep(Duration::from_millis(1));
            })
        };

        let mut control = TakeControl::new(store, clock);
        control.connect(FakeStreams { recorder }, command_tx, event_rx, fault_rx);

        Rig {
            control,
            faults: fault_tx,
            backend,
            callback,
        }
    }

    fn fault(fatal: bool, message: &str) -> StreamFault {
        StreamFault {
            fatal,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_fault_monitor_reports_fatal_once() {
        let (tx, rx) = mpsc::channel();
        let mut monitor = FaultMonitor::new();
        assert_eq!(monitor.check(), None);

        monitor.attach(rx);
        tx.send(fault(false, "xrun")).unwrap();
        tx.send(fault(true, "unplugged")).unwrap();
        tx.send(fault(true, "unplugged again")).unwrap();

        assert_eq!(monitor.check(), Some("unplugged".to_string()));
        assert_eq!(monitor.check(), None);
        assert_eq!(monitor.check(), None);
    }

    #[test]
    fn test_fault_monitor_ignores_closed_streams() {
        let (tx, rx) = mpsc::channel::<StreamFault>();
        let mut monitor = FaultMonitor::new();
        monitor.attach(rx);
        drop(tx);
        assert_eq!(monitor.check(), None);
        assert_eq!(monitor.check(), None);
    }

    #[test]
    fn test_commit_through_running_callback() {
        let mut rig = rig();
        rig.control.begin_take("kept").unwrap();
        assert_eq!(rig.control.state(), SessionState::Recording);
        thread::sleep(Duration::from_millis(20));

        let take = rig.control.commit().unwrap();
        assert!(take.duration_frames() > 0);
        assert_eq!(rig.control.state(), SessionState::Idle);
        assert_eq!(rig.control.store().len(), 1);

        drop(rig.control.disconnect());
        rig.callback.join().unwrap();
    }

    #[test]
    fn test_device_loss_discards_take_and_reports_once() {
        let mut rig = rig();
        rig.control.begin_take("doomed").unwrap();
        assert!(rig.control.store().is_recording());

        rig.faults.send(fault(false, "xrun")).unwrap();
        assert!(rig.control.poll().is_none());
        assert_eq!(rig.control.state(), SessionState::Recording);

        rig.faults.send(fault(true, "device unplugged")).unwrap();
        match rig.control.poll() {
            Some(TakeError::InputLost(reason)) => assert_eq!(reason, "device unplugged"),
            other => panic!("expected InputLost, got {:?}", other),
        }

        assert_eq!(rig.control.state(), SessionState::Idle);
        assert!(!rig.control.is_connected());
        assert!(!rig.control.store().is_recording());
        assert!(rig.control.store().is_empty());
        assert!(rig.backend.is_empty());

        assert!(rig.control.poll().is_none());
        assert!(rig.control.poll().is_none());
        assert!(matches!(
            rig.control.begin_take("after"),
            Err(TakeError::InvalidState(_))
        ));
        rig.callback.join().unwrap();
    }

    #[test]
    fn test_fault_before_begin_fails_the_take() {
        let mut rig = rig();
        rig.faults.send(fault(true, "device unplugged")).unwrap();

        assert!(matches!(
            rig.control.begin_take("never"),
            Err(TakeError::InputLost(_))
        ));
        assert_eq!(rig.control.state(), SessionState::Idle);
        assert!(!rig.control.store().is_recording());
        assert!(rig.control.poll().is_none());
        rig.callback.join().unwrap();
    }
}
