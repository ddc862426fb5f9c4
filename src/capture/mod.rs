//! Audio capture source (component A).
//!
//! Opens a local input device through `cpal` and delivers fixed-size raw
//! blocks to an async-side sink. The device driver invokes our callback on
//! its own thread, outside the tokio runtime; the callback never touches
//! shared async state directly. Instead it hands the block to the runtime
//! via a captured [`tokio::runtime::Handle`], mirroring the thread-to-async
//! bridge the runtime task spawner abstraction in this stack uses elsewhere.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat as CpalSampleFormat, Stream, StreamConfig};
use tokio::runtime::Handle;
use tracing::{info, instrument, warn};

use crate::config::CaptureConfig;
use crate::error::CaptureOpenError;

/// Sink a captured block is delivered to. Implementors must not block; the
/// callback that invokes this runs on the tokio scheduler (see [`AudioCaptureSource::start`]),
/// never on the driver thread itself.
pub trait BlockSink: Send + Sync + 'static {
    fn on_block(&self, block: Bytes);
}

impl<F> BlockSink for F
where
    F: Fn(Bytes) + Send + Sync + 'static,
{
    fn on_block(&self, block: Bytes) {
        self(block)
    }
}

/// Owns the open device stream. Dropping it (or calling [`Self::stop`]) stops
/// capture; no further blocks are delivered after `stop()` returns.
pub struct AudioCaptureSource {
    stream: Option<Stream>,
    shutdown: Arc<AtomicBool>,
}

impl AudioCaptureSource {
    /// Opens the device and starts delivering blocks to `sink` on the given
    /// runtime handle. Fails eagerly if the device or format cannot be
    /// negotiated; never panics on an unsupported combination.
    #[instrument(skip(config, sink, handle))]
    pub fn start<S: BlockSink>(
        config: &CaptureConfig,
        sink: Arc<S>,
        handle: Handle,
    ) -> Result<Self, CaptureOpenError> {
        let host = cpal::default_host();
        let devices: Vec<_> = host
            .input_devices()
            .map_err(|e| CaptureOpenError::UnsupportedFormat(e.to_string()))?
            .collect();
        let device = devices
            .into_iter()
            .nth(config.device_index)
            .ok_or(CaptureOpenError::NoSuchDevice(config.device_index))?;

        let supported = device
            .default_input_config()
            .map_err(|e| CaptureOpenError::UnsupportedFormat(e.to_string()))?;

        let cpal_sample_format = match config.sample_format {
            crate::config::SampleFormat::I16 => CpalSampleFormat::I16,
            crate::config::SampleFormat::I32 => CpalSampleFormat::I32,
            crate::config::SampleFormat::I24 => {
                return Err(CaptureOpenError::UnsupportedFormat(
                    "24-bit samples are not negotiable on this host".into(),
                ));
            }
        };
        if supported.sample_format() != cpal_sample_format {
            warn!(
                requested = %config.sample_format,
                device_default = ?supported.sample_format(),
                "device default sample format differs from configured format; proceeding with configured format"
            );
        }

        let stream_config = StreamConfig {
            channels: config.channels.count(),
            sample_rate: cpal::SampleRate(config.sample_rate.hz()),
            buffer_size: cpal::BufferSize::Fixed(config.block_size.samples()),
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let cb_shutdown = Arc::clone(&shutdown);

        let error_sink = Arc::clone(&sink);
        let error_handle = handle.clone();

        let stream = match config.sample_format {
            crate::config::SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    deliver(&cb_shutdown, &sink, &handle, samples_to_bytes(data));
                },
                move |err| on_stream_error(&error_sink, &error_handle, err),
                None,
            ),
            crate::config::SampleFormat::I32 => device.build_input_stream(
                &stream_config,
                move |data: &[i32], _: &cpal::InputCallbackInfo| {
                    deliver(&cb_shutdown, &sink, &handle, samples_to_bytes(data));
                },
                move |err| on_stream_error(&error_sink, &error_handle, err),
                None,
            ),
            crate::config::SampleFormat::I24 => unreachable!("rejected above"),
        }
        .map_err(CaptureOpenError::BuildStream)?;

        stream.play().map_err(CaptureOpenError::PlayStream)?;

        info!(
            device = config.device_index,
            sample_rate = config.sample_rate.hz(),
            channels = config.channels.count(),
            "audio capture started"
        );

        Ok(Self {
            stream: Some(stream),
            shutdown,
        })
    }

    /// Idempotent. Guarantees no further callback delivers a block once this
    /// returns.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.stream.take();
    }
}

impl Drop for AudioCaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn deliver<S: BlockSink>(
    shutdown: &Arc<AtomicBool>,
    sink: &Arc<S>,
    handle: &Handle,
    block: Bytes,
) {
    if shutdown.load(Ordering::Acquire) {
        return;
    }
    let sink = Arc::clone(sink);
    let shutdown = Arc::clone(shutdown);
    handle.spawn(async move {
        if !shutdown.load(Ordering::Acquire) {
            sink.on_block(block);
        }
    });
}

fn on_stream_error<S: BlockSink>(_sink: &Arc<S>, _handle: &Handle, err: cpal::StreamError) {
    warn!(error = %err, "audio input stream reported an error");
}

fn samples_to_bytes<T: bytemuck_cast::Sample>(data: &[T]) -> Bytes {
    T::to_le_bytes(data)
}

/// Minimal little-endian sample-to-bytes conversion, kept local rather than
/// pulling in a dedicated bytemuck dependency for two integer widths.
mod bytemuck_cast {
    use bytes::{BufMut, Bytes, BytesMut};

    pub trait Sample {
        fn to_le_bytes(data: &[Self]) -> Bytes
        where
            Self: Sized;
    }

    impl Sample for i16 {
        fn to_le_bytes(data: &[Self]) -> Bytes {
            let mut buf = BytesMut::with_capacity(data.len() * 2);
            for sample in data {
                buf.put_i16_le(*sample);
            }
            buf.freeze()
        }
    }

    impl Sample for i32 {
        fn to_le_bytes(data: &[Self]) -> Bytes {
            let mut buf = BytesMut::with_capacity(data.len() * 4);
            for sample in data {
                buf.put_i32_le(*sample);
            }
            buf.freeze()
        }
    }
}
