//! Capture/render backend on top of `cpal`.
//!
//! `cpal::Stream` is not `Send` on every platform, so the streams are built
//! and kept alive on a dedicated thread; the handle only holds a channel that
//! tells that thread to drop them.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Sender};

use super::render_queue::{render_queue, RenderCounters};
use super::{ActiveStream, AudioBackend, BlockIo, StreamCallback, StreamRequest};
use crate::session::join_with_timeout;
use crate::{LipsyncError, Result};

/// Rendered blocks that may queue up before new output is dropped.
const OUTPUT_QUEUE_BLOCKS: usize = 4;

#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open(&self, request: &StreamRequest, callback: StreamCallback) -> Result<Box<dyn ActiveStream>> {
        let (init_tx, init_rx) = bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let request = request.clone();

        let thread = thread::Builder::new()
            .name("mouthsync-audio".into())
            .spawn(move || {
                let (streams, counters) = match build_streams(&request, callback) {
                    Ok(built) => built,
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };
                let _ = init_tx.send(Ok(()));
                // Blocks until the handle is closed or dropped.
                let _ = stop_rx.recv();
                drop(streams);
                if let Some(counters) = counters {
                    tracing::debug!(
                        overflow = counters.overflow(),
                        underrun = counters.underrun(),
                        "render queue totals"
                    );
                }
            })?;

        match init_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStream {
                stop: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => Err(LipsyncError::Stream("audio thread exited during startup".into())),
        }
    }
}

struct CpalStream {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ActiveStream for CpalStream {
    fn close(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            join_with_timeout(thread, Duration::from_secs(1), "audio");
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn stream_error(context: &str, err: impl std::fmt::Display) -> LipsyncError {
    LipsyncError::Stream(format!("{context}: {err}"))
}

fn find_device(
    host: &cpal::Host,
    name: Option<&str>,
    input: bool,
) -> Result<cpal::Device> {
    if let Some(name) = name {
        let devices = if input {
            host.input_devices()
        } else {
            host.output_devices()
        }
        .map_err(|err| stream_error("cannot list devices", err))?;
        for device in devices {
            if device.name().is_ok_and(|candidate| candidate == name) {
                return Ok(device);
            }
        }
        tracing::warn!(device = name, "audio device not found, using the default");
    }
    let default = if input {
        host.default_input_device()
    } else {
        host.default_output_device()
    };
    default.ok_or_else(|| LipsyncError::Stream("no default audio device".into()))
}

fn stream_config(channels: u16, request: &StreamRequest) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(request.sample_rate),
        buffer_size: if request.low_latency {
            cpal::BufferSize::Fixed(request.block_size as u32)
        } else {
            cpal::BufferSize::Default
        },
    }
}

fn build_streams(
    request: &StreamRequest,
    mut callback: StreamCallback,
) -> Result<(Vec<cpal::Stream>, Option<Arc<RenderCounters>>)> {
    let host = cpal::default_host();
    let input_device = find_device(&host, request.input_device.as_deref(), true)?;
    let input_channels = input_device
        .default_input_config()
        .map_err(|err| stream_error("no input configuration", err))?
        .channels();

    let block_size = request.block_size.max(1);
    let mut streams = Vec::with_capacity(2);

    let (output_channels, mut producer, counters) = if request.with_output {
        let output_device = find_device(&host, request.output_device.as_deref(), false)?;
        let channels = output_device
            .default_output_config()
            .map_err(|err| stream_error("no output configuration", err))?
            .channels();
        let (producer, mut consumer, counters) =
            render_queue(block_size * channels as usize * OUTPUT_QUEUE_BLOCKS);
        let stream = output_device
            .build_output_stream(
                &stream_config(channels, request),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    consumer.fill(data);
                },
                |err| tracing::warn!(%err, "output stream error"),
                None,
            )
            .map_err(|err| stream_error("cannot open output", err))?;
        streams.push(stream);
        (channels as usize, Some(producer), Some(counters))
    } else {
        (0, None, None)
    };

    let input_channels = input_channels as usize;
    let mut pending: Vec<f32> = Vec::with_capacity(block_size * input_channels);
    let mut rendered: Vec<f32> = vec![0.0; block_size * output_channels];
    let input = input_device
        .build_input_stream(
            &stream_config(input_channels as u16, request),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Re-block to the session's block size before processing.
                for &sample in data {
                    pending.push(sample);
                    if pending.len() < block_size * input_channels {
                        continue;
                    }
                    callback(BlockIo {
                        input: &pending,
                        input_channels,
                        output: &mut rendered,
                        output_channels,
                    });
                    pending.clear();
                    if let Some(producer) = producer.as_mut() {
                        producer.push(&rendered);
                    }
                }
            },
            |err| tracing::warn!(%err, "input stream error"),
            None,
        )
        .map_err(|err| stream_error("cannot open input", err))?;
    streams.push(input);

    for stream in &streams {
        stream
            .play()
            .map_err(|err| stream_error("cannot start stream", err))?;
    }
    tracing::info!(
        input_channels,
        output_channels,
        sample_rate = request.sample_rate,
        block_size,
        "audio streams running"
    );
    Ok((streams, counters))
}
