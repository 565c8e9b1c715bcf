//! Audio output collaborators.
//!
//! The scheduler only ever talks to a boxed [`AudioSink`]. Real device output
//! lives behind the `playback` feature so the core builds without system
//! audio libraries.

#[cfg(feature = "playback")]
mod device;

#[cfg(feature = "playback")]
pub use device::{DeviceOutput, DeviceSink};

use crate::{ClickBuffer, Result};

/// Sample encoding accepted by sinks. Only signed 16-bit PCM is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    I16,
}

/// Description of the stream a sink is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl StreamFormat {
    /// Mono 16-bit PCM at the given rate.
    pub fn mono_i16(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            sample_format: SampleFormat::I16,
        }
    }
}

/// Something that can open a playback stream.
pub trait AudioOutput {
    fn open(&self, format: StreamFormat) -> Result<Box<dyn AudioSink>>;
}

/// An open playback stream. Owned by the beat worker while it runs.
pub trait AudioSink: Send {
    fn format(&self) -> StreamFormat;

    /// Plays one click. May block for up to the length of the click.
    fn write(&mut self, click: &ClickBuffer) -> Result<()>;

    /// Releases the device. Further writes are undefined.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Output that accepts everything and plays nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn open(&self, format: StreamFormat) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(NullSink::new(format)))
    }
}

/// Sink returned by [`NullOutput`]; counts what it was given.
#[derive(Debug)]
pub struct NullSink {
    format: StreamFormat,
    written: usize,
}

impl NullSink {
    pub fn new(format: StreamFormat) -> Self {
        Self { format, written: 0 }
    }

    /// Number of clicks accepted so far.
    pub fn written(&self) -> usize {
        self.written
    }
}

impl AudioSink for NullSink {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn write(&mut self, click: &ClickBuffer) -> Result<()> {
        tracing::trace!(samples = click.len(), "discarding click");
        self.written += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{synth, Tempo};

    #[test]
    fn null_output_opens_requested_format() {
        let format = StreamFormat::mono_i16(48_000);
        let sink = NullOutput.open(format).unwrap();
        assert_eq!(sink.format(), format);
        assert_eq!(sink.format().channels, 1);
        assert_eq!(sink.format().sample_format, SampleFormat::I16);
    }

    #[test]
    fn null_sink_counts_writes() {
        let mut sink = NullSink::new(StreamFormat::mono_i16(44_100));
        let click = synth::synthesize(Tempo::DEFAULT, 44_100);
        sink.write(&click).unwrap();
        sink.write(&click).unwrap();
        sink.close().unwrap();
        assert_eq!(sink.written(), 2);
    }
}
