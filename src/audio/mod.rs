pub mod callback;
pub mod control;
pub mod device;
pub mod engine;
pub mod playback;

pub use callback::{InputControls, RealtimeRecorder, RtCommand, RtEvent, StreamFault};
pub use control::{FaultMonitor, TakeControl};
pub use engine::AudioEngine;
pub use playback::BackingTrack;
