//! Frame producer: capture, encode and broadcast on a fixed interval.
//!
//! Capture and JPEG encoding sit behind the [`FrameSource`] and
//! [`FrameEncoder`] traits. The pump never queues frames: each captured
//! sample is encoded and broadcast before the next capture.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use crate::dispatcher::Dispatcher;

/// Pixel layout of a captured sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Already JPEG-compressed.
    Jpeg,
    /// Uncompressed interleaved pixels.
    Raw {
        width: u32,
        height: u32,
        channels: u8,
    },
}

/// One captured frame.
#[derive(Debug, Clone)]
pub struct FrameSample {
    pub data: Bytes,
    pub format: FrameFormat,
}

/// Produces frames on demand.
pub trait FrameSource: Send {
    /// Capture one frame, or `None` if none is available right now.
    fn capture(&mut self) -> Option<FrameSample>;
}

/// Turns a captured sample into JPEG bytes.
pub trait FrameEncoder: Send {
    fn encode_jpeg(&self, sample: &FrameSample) -> Result<Bytes, EncodeError>;
}

#[derive(Debug, Error)]
pub enum FrameSourceError {
    #[error("Failed to read frame directory '{path}': {err}", path = .0.display(), err = .1)]
    ReadDir(PathBuf, #[source] io::Error),
    #[error("No JPEG files in frame directory '{}'", .0.display())]
    Empty(PathBuf),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("cannot encode {0:?} frames")]
    UnsupportedFormat(FrameFormat),
    #[error("empty frame")]
    Empty,
}

/// Replays the JPEG files of a directory in name order, looping forever.
#[derive(Debug)]
pub struct JpegDirSource {
    files: Vec<PathBuf>,
    next: usize,
}

impl JpegDirSource {
    pub fn open(dir: &Path) -> Result<Self, FrameSourceError> {
        let entries =
            fs::read_dir(dir).map_err(|e| FrameSourceError::ReadDir(dir.to_path_buf(), e))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_jpeg(path))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(FrameSourceError::Empty(dir.to_path_buf()));
        }

        info!(dir = %dir.display(), frames = files.len(), "Opened frame directory");
        Ok(Self { files, next: 0 })
    }
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false)
}

impl FrameSource for JpegDirSource {
    fn capture(&mut self) -> Option<FrameSample> {
        let path = self.files.get(self.next)?;
        self.next = (self.next + 1) % self.files.len();

        match fs::read(path) {
            Ok(data) => Some(FrameSample {
                data: Bytes::from(data),
                format: FrameFormat::Jpeg,
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read frame");
                None
            }
        }
    }
}

/// Encoder for sources that already produce JPEG data.
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegPassthrough;

impl FrameEncoder for JpegPassthrough {
    fn encode_jpeg(&self, sample: &FrameSample) -> Result<Bytes, EncodeError> {
        match sample.format {
            FrameFormat::Jpeg if sample.data.is_empty() => Err(EncodeError::Empty),
            FrameFormat::Jpeg => Ok(sample.data.clone()),
            other => Err(EncodeError::UnsupportedFormat(other)),
        }
    }
}

/// Background thread feeding frames to the dispatcher.
pub struct FramePump {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<u64>,
}

impl FramePump {
    /// Start pumping frames, one every `interval`.
    ///
    /// Broadcasts run on `runtime`; the capture loop itself stays on its
    /// own OS thread so a blocking camera read never stalls the runtime.
    pub fn spawn<S, E>(
        mut source: S,
        encoder: E,
        dispatcher: Dispatcher,
        interval: Duration,
        runtime: Handle,
    ) -> io::Result<Self>
    where
        S: FrameSource + 'static,
        E: FrameEncoder + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("frame-pump".to_string())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "Frame pump started");
                let mut sent = 0u64;

                while !thread_stop.load(Ordering::Relaxed) {
                    let started = Instant::now();
                    if pump_once(&mut source, &encoder, &dispatcher, &runtime) {
                        sent += 1;
                    }
                    if let Some(rest) = interval.checked_sub(started.elapsed()) {
                        thread::sleep(rest);
                    }
                }

                debug!(sent, "Frame pump stopped");
                sent
            })?;

        Ok(Self { stop, thread })
    }

    /// Stop the pump and wait for it, returning the number of frames sent.
    pub fn stop(self) -> u64 {
        self.stop.store(true, Ordering::Relaxed);
        self.thread.join().unwrap_or(0)
    }
}

/// Capture, encode and broadcast one frame. Returns whether a frame was sent.
fn pump_once<S, E>(source: &mut S, encoder: &E, dispatcher: &Dispatcher, runtime: &Handle) -> bool
where
    S: FrameSource,
    E: FrameEncoder,
{
    let Some(sample) = source.capture() else {
        trace!("No frame captured");
        return false;
    };

    match encoder.encode_jpeg(&sample) {
        Ok(jpeg) => {
            let report = runtime.block_on(dispatcher.send_frame(&jpeg));
            trace!(bytes = jpeg.len(), delivered = report.delivered, "Frame sent");
            true
        }
        Err(e) => {
            warn!(error = %e, "Skipping frame");
            false
        }
    }
}
