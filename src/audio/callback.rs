use rtrb::{Consumer, Producer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::playback::BackingTrack;
use crate::error::TakeError;
use crate::session::{capture_block, PunchWindowTracker, SessionClock};
use crate::store::TakeBuilder;
use crate::types::{AtomicF32, COMMAND_QUEUE_SIZE, MAX_BLOCK_FRAMES};

/// Control thread -> audio callback
#[derive(Debug)]
pub enum RtCommand {
    /// Start capturing into this take; resets the clock
    Begin(TakeBuilder),
    /// Stop and hand the take back for commit
    Stop,
    /// Stop and hand the take back for discarding
    Abort,
}

/// Audio callback -> control thread. Takes always travel back so they are
/// committed or dropped off the realtime thread.
#[derive(Debug)]
pub enum RtEvent {
    Started,
    Stopped { take: TakeBuilder, final_frame: u64 },
    Aborted { take: TakeBuilder },
    /// The take ring filled up; capture stopped on its own
    Overrun { take: TakeBuilder, dropped: u64 },
    /// A `Begin` arrived while a take was already running
    Rejected { take: TakeBuilder },
    /// `Stop`/`Abort` arrived with no take running
    Idle,
}

/// Atomics shared between the callback and the UI
#[derive(Debug)]
pub struct InputControls {
    /// Input gain applied before recording (0.0 - 1.0)
    pub gain: AtomicF32,
    /// Whether the input is mixed into the monitor output
    pub monitoring: AtomicBool,
    /// Current input peak for metering (0.0 - 1.0)
    pub peak_level: AtomicF32,
}

impl InputControls {
    pub fn new() -> Self {
        Self {
            gain: AtomicF32::new(1.0),
            monitoring: AtomicBool::new(false),
            peak_level: AtomicF32::new(0.0),
        }
    }

    /// Get input gain (audio-thread safe)
    pub fn get_gain(&self) -> f32 {
        self.gain.load(Ordering::Relaxed)
    }

    /// Set input gain (0.0 - 1.0)
    pub fn set_gain(&self, gain: f32) {
        self.gain.store(gain.clamp(0.0, 1.0), Ordering::Relaxed);
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::Relaxed)
    }

    pub fn set_monitoring(&self, monitoring: bool) {
        self.monitoring.store(monitoring, Ordering::Relaxed);
    }

    /// Get peak level for metering (audio-thread safe)
    pub fn get_peak_level(&self) -> f32 {
        self.peak_level.load(Ordering::Relaxed)
    }

    /// Decay peak level (called from UI thread)
    pub fn decay_peak_level(&self, decay_rate: f32) {
        let new_peak = (self.get_peak_level() - decay_rate).max(0.0);
        self.peak_level.store(new_peak, Ordering::Relaxed);
    }
}

impl Default for InputControls {
    fn default() -> Self {
        Self::new()
    }
}

/// State owned by the input callback.
///
/// CRITICAL: `process_input` runs in a real-time audio thread:
/// - NO memory allocations (scratch buffers are sized up front)
/// - NO mutex locks (atomics and SPSC rings only)
/// - NO I/O operations
/// - NO dropping of take builders (they go back to the control thread)
pub struct RealtimeRecorder {
    clock: Arc<SessionClock>,
    punch: Arc<PunchWindowTracker>,
    controls: Arc<InputControls>,
    backing: Option<Arc<BackingTrack>>,
    commands: Consumer<RtCommand>,
    events: Producer<RtEvent>,
    monitor: Producer<f32>,
    take: Option<TakeBuilder>,

    /// Events waiting for room in the event ring, oldest first. Commands
    /// are not read while this is non-empty, so it holds at most one command
    /// reply plus one overrun and never grows past its preallocated size.
    pending: VecDeque<RtEvent>,

    num_input_channels: usize,
    scratch: Vec<f32>,
    monitor_scratch: Vec<f32>,
}

impl RealtimeRecorder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<SessionClock>,
        punch: Arc<PunchWindowTracker>,
        controls: Arc<InputControls>,
        backing: Option<Arc<BackingTrack>>,
        commands: Consumer<RtCommand>,
        events: Producer<RtEvent>,
        monitor: Producer<f32>,
        num_input_channels: usize,
    ) -> Self {
        let num_input_channels = num_input_channels.max(1);
        Self {
            clock,
            punch,
            controls,
            backing,
            commands,
            events,
            monitor,
            take: None,
            pending: VecDeque::with_capacity(COMMAND_QUEUE_SIZE),
            num_input_channels,
            scratch: vec![0.0; MAX_BLOCK_FRAMES * num_input_channels],
            monitor_scratch: vec![0.0; MAX_BLOCK_FRAMES * 2],
        }
    }

    /// Whether a take is being captured
    pub fn is_recording(&self) -> bool {
        self.take.is_some()
    }

    /// Process one device buffer of interleaved input
    pub fn process_input(&mut self, input_data: &[f32]) {
        self.flush_pending();
        while self.pending.is_empty() {
            match self.commands.pop() {
                Ok(command) => self.handle_command(command),
                Err(_) => break,
            }
        }

        let chunk_len = self.scratch.len();
        for chunk in input_data.chunks(chunk_len) {
            self.process_chunk(chunk);
        }
    }

    fn handle_command(&mut self, command: RtCommand) {
        match command {
            RtCommand::Begin(take) => {
                if self.take.is_some() {
                    self.emit(RtEvent::Rejected { take });
                    return;
                }
                self.clock.start();
                self.take = Some(take);
                self.emit(RtEvent::Started);
            }
            RtCommand::Stop => match self.take.take() {
                Some(take) => {
                    let final_frame = self.clock.stop();
                    self.emit(RtEvent::Stopped { take, final_frame });
                }
                None => self.emit(RtEvent::Idle),
            },
            RtCommand::Abort => match self.take.take() {
                Some(take) => {
                    self.clock.stop();
                    self.emit(RtEvent::Aborted { take });
                }
                None => self.emit(RtEvent::Idle),
            },
        }
    }

    fn process_chunk(&mut self, chunk: &[f32]) {
        let channels = self.num_input_channels;
        let frames = chunk.len() / channels;
        let len = frames * channels;

        // Apply gain and meter
        let gain = self.controls.get_gain();
        let mut peak = self.controls.get_peak_level();
        for (dst, &src) in self.scratch[..len].iter_mut().zip(chunk) {
            *dst = src * gain;
            peak = peak.max(dst.abs());
        }
        self.controls.peak_level.store(peak, Ordering::Relaxed);

        // Backing track at the clock position this block will occupy
        let monitor = &mut self.monitor_scratch[..frames * 2];
        monitor.fill(0.0);
        let block_start = self.clock.current_frame();
        if self.take.is_some() {
            if let Some(backing) = &self.backing {
                backing.render_stereo(block_start, monitor);
            }
        }

        if self.controls.is_monitoring() {
            for (pair, frame) in monitor.chunks_exact_mut(2).zip(self.scratch[..len].chunks_exact(channels)) {
                let mono = frame.iter().sum::<f32>() / channels as f32;
                pair[0] += mono;
                pair[1] += mono;
            }
        }

        for &sample in monitor.iter() {
            let _ = self.monitor.push(sample);
        }

        if let Some(take) = self.take.as_mut() {
            match capture_block(&self.clock, &self.punch, take, &self.scratch[..len]) {
                Ok(_) => {}
                Err(TakeError::BufferOverrun { dropped }) => {
                    if let Some(take) = self.take.take() {
                        self.clock.stop();
                        self.emit(RtEvent::Overrun { take, dropped });
                    }
                }
                // Clock inactive; nothing else can fail here
                Err(_) => {}
            }
        }
    }

    fn emit(&mut self, event: RtEvent) {
        self.flush_pending();
        // Older events go first
        if !self.pending.is_empty() {
            self.pending.push_back(event);
            return;
        }
        if let Err(rtrb::PushError::Full(event)) = self.events.push(event) {
            self.pending.push_back(event);
        }
    }

    fn flush_pending(&mut self) {
        while let Some(event) = self.pending.pop_front() {
            if let Err(rtrb::PushError::Full(event)) = self.events.push(event) {
                self.pending.push_front(event);
                break;
            }
        }
    }
}

/// Create the input callback closure
///
/// This returns a closure that will be called by cpal for each audio buffer
pub fn create_audio_callback(
    mut recorder: RealtimeRecorder,
) -> impl FnMut(&[f32], &cpal::InputCallbackInfo) + Send + 'static {
    move |data: &[f32], _info: &cpal::InputCallbackInfo| {
        recorder.process_input(data);
    }
}

/// Create the monitor output callback closure
///
/// Reads stereo frames from the monitor ring and routes them to the
/// 1-indexed output channels `monitor_start` and `monitor_end`
pub fn create_monitor_callback(
    mut consumer: Consumer<f32>,
    output_channels: usize,
    monitor_start: usize,
    monitor_end: usize,
) -> impl FnMut(&mut [f32], &cpal::OutputCallbackInfo) + Send + 'static {
    let left = monitor_start.saturating_sub(1);
    let right = monitor_end.saturating_sub(1);
    let output_channels = output_channels.max(1);

    move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
        for frame in data.chunks_mut(output_channels) {
            frame.fill(0.0);
            let l = consumer.pop().unwrap_or(0.0);
            let r = consumer.pop().unwrap_or(0.0);
            if left < frame.len() {
                frame[left] = l;
            }
            if right < frame.len() {
                frame[right] = r;
            }
        }
    }
}

/// A stream error reported by cpal
#[derive(Debug, Clone)]
pub struct StreamFault {
    /// The device is gone and the stream will not recover
    pub fatal: bool,
    pub message: String,
}

/// Error callback for audio streams. Faults go to the control thread,
/// which decides whether the take is lost.
pub fn create_error_callback(
    faults: std::sync::mpsc::Sender<StreamFault>,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        let fault = StreamFault {
            fatal: matches!(err, cpal::StreamError::DeviceNotAvailable),
            message: err.to_string(),
        };
        let _ = faults.send(fault);
    }
}
