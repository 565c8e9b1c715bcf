//! System audio device output using rodio.

use rodio::{buffer::SamplesBuffer, OutputStream, OutputStreamHandle, Sink};

use super::{AudioOutput, AudioSink, StreamFormat};
use crate::{ClickBuffer, MetronomeError, Result};

/// Default output device.
///
/// The underlying `OutputStream` is not `Send`, so this value stays on the
/// thread that created it and must outlive every sink opened from it.
pub struct DeviceOutput {
    _stream: OutputStream,
    handle: OutputStreamHandle,
}

impl DeviceOutput {
    pub fn try_default() -> Result<Self> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| MetronomeError::Audio(format!("failed to open output stream: {e}")))?;
        tracing::info!("opened default audio output");
        Ok(Self {
            _stream: stream,
            handle,
        })
    }
}

impl AudioOutput for DeviceOutput {
    fn open(&self, format: StreamFormat) -> Result<Box<dyn AudioSink>> {
        let sink = Sink::try_new(&self.handle)
            .map_err(|e| MetronomeError::Audio(format!("failed to create audio sink: {e}")))?;
        Ok(Box::new(DeviceSink { sink, format }))
    }
}

impl std::fmt::Debug for DeviceOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceOutput").finish()
    }
}

/// Playback stream on the default device.
pub struct DeviceSink {
    sink: Sink,
    format: StreamFormat,
}

impl AudioSink for DeviceSink {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn write(&mut self, click: &ClickBuffer) -> Result<()> {
        if click.sample_rate() != self.format.sample_rate {
            return Err(MetronomeError::Audio(format!(
                "click rendered at {} Hz but stream runs at {} Hz",
                click.sample_rate(),
                self.format.sample_rate
            )));
        }

        self.sink.append(SamplesBuffer::new(
            self.format.channels,
            self.format.sample_rate,
            click.samples().to_vec(),
        ));
        // Behave like a blocking device write: return once the click is out.
        self.sink.sleep_until_end();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.sink.stop();
        Ok(())
    }
}

impl std::fmt::Debug for DeviceSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSink")
            .field("format", &self.format)
            .finish()
    }
}
