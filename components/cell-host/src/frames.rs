//! Frame monitor
//!
//! # Purpose
//! Host consumer of the media port. While the bare-metal side has recording
//! enabled, every new audio and video frame is handed to a [`FrameSink`];
//! frames the monitor was too slow to see are counted as dropped.
//!
//! # Architecture
//! - Disabled: poll the `enabled` flag every 100 ms
//! - Enabled: one recording session per enable period. Audio is taken
//!   before video in each iteration, and the sink sees `begin`/`end` around
//!   the session
//! - Frames published before a session starts are skipped
//! - A frame whose descriptor points outside guest memory is logged and
//!   skipped; the session goes on
//!
//! [`RawDumpSink`] writes the raw planes and samples to numbered files,
//! taking the lowest unused `recNNNN` name.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cell_comms::frame::{AudioFrame, FrameConsumer, FrameUpdate, MediaPort, VideoFrame};
use cell_comms::{Notify, Param};

use crate::error::{HostError, Result};
use crate::guest_mem::GuestMemory;

/// Poll interval while recording is disabled
pub const DISABLED_POLL: Duration = Duration::from_millis(100);

/// Highest recording number tried
pub const MAX_RECORDINGS: u32 = 10_000;

/// Receiver of recorded frames
pub trait FrameSink {
    /// A recording session starts
    fn begin(&mut self) -> Result<()>;
    fn audio(&mut self, frame: &FrameUpdate<AudioFrame>) -> Result<()>;
    fn video(&mut self, frame: &FrameUpdate<VideoFrame>) -> Result<()>;
    /// The session ended because recording was disabled or the monitor stopped
    fn end(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub sessions: u64,
    pub audio_frames: u64,
    pub video_frames: u64,
    pub audio_dropped: u64,
    pub video_dropped: u64,
    /// Frames skipped because their buffers were not in guest memory
    pub bad_frames: u64,
}

pub struct FrameMonitor<'a, N> {
    port: &'a MediaPort,
    notify: N,
    stats: FrameStats,
}

impl<'a, N: Notify> FrameMonitor<'a, N> {
    pub fn new(port: &'a MediaPort, notify: N) -> Self {
        Self {
            port,
            notify,
            stats: FrameStats::default(),
        }
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Wait until recording is enabled
    ///
    /// # Returns
    /// `false` if `stop` was set first
    pub fn wait_enabled(&self, stop: &AtomicBool) -> bool {
        while !self.port.is_enabled() {
            if stop.load(Ordering::Acquire) {
                return false;
            }
            std::thread::sleep(DISABLED_POLL);
        }
        !stop.load(Ordering::Acquire)
    }

    /// Take the newest audio frame, then the newest video frame
    ///
    /// # Returns
    /// `true` if either channel had a new frame
    pub fn poll_once<S: FrameSink + ?Sized>(
        &mut self,
        audio: &mut FrameConsumer<'_, AudioFrame>,
        video: &mut FrameConsumer<'_, VideoFrame>,
        sink: &mut S,
    ) -> Result<bool> {
        let mut any = false;

        if let Some(update) = audio.poll() {
            self.stats.audio_frames += 1;
            self.stats.audio_dropped += u64::from(update.dropped);
            let result = sink.audio(&update);
            self.skip_bad_frame(result, "audio", update.frame_no)?;
            any = true;
        }
        if let Some(update) = video.poll() {
            self.stats.video_frames += 1;
            self.stats.video_dropped += u64::from(update.dropped);
            let result = sink.video(&update);
            self.skip_bad_frame(result, "video", update.frame_no)?;
            any = true;
        }

        Ok(any)
    }

    fn skip_bad_frame(&mut self, result: Result<()>, kind: &str, frame_no: u32) -> Result<()> {
        match result {
            Err(HostError::GuestBuffer { addr, len }) => {
                log::warn!("{kind} frame {frame_no} skipped: buffer {addr:#x}+{len:#x} not in guest memory");
                self.stats.bad_frames += 1;
                Ok(())
            }
            other => other,
        }
    }

    /// Record one enable period
    pub fn run_session<S: FrameSink + ?Sized>(&mut self, sink: &mut S, stop: &AtomicBool) -> Result<()> {
        let mut audio = FrameConsumer::new(&self.port.audio, "audio");
        let mut video = FrameConsumer::new(&self.port.video, "video");

        sink.begin()?;
        self.stats.sessions += 1;
        log::info!("recording session {} started", self.stats.sessions);

        let mut result = Ok(());
        while self.port.is_enabled() && !stop.load(Ordering::Acquire) {
            match self.poll_once(&mut audio, &mut video, sink) {
                Ok(true) => {}
                Ok(false) => self.notify.wait_for_change(),
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }

        // The sink is closed even when the session failed.
        let ended = sink.end();
        result?;
        ended?;
        log::info!(
            "recording session {} done: {} video / {} audio frames, {} / {} dropped",
            self.stats.sessions,
            self.stats.video_frames,
            self.stats.audio_frames,
            self.stats.video_dropped,
            self.stats.audio_dropped
        );
        Ok(())
    }

    /// Record every enable period until `stop` is set
    pub fn run<S: FrameSink + ?Sized>(&mut self, sink: &mut S, stop: &AtomicBool) -> Result<FrameStats> {
        while self.wait_enabled(stop) {
            self.run_session(sink, stop)?;
        }
        Ok(self.stats)
    }
}

/// Lowest unused `recNNNN.<extension>` in `dir`
pub fn next_recording_path(dir: &Path, extension: &str) -> Result<PathBuf> {
    (0..MAX_RECORDINGS)
        .map(|n| dir.join(format!("rec{n:04}.{extension}")))
        .find(|path| !path.exists())
        .ok_or_else(|| HostError::RecordingsExhausted {
            dir: dir.to_path_buf(),
        })
}

struct Recording {
    video: BufWriter<File>,
    audio: BufWriter<File>,
}

/// Writes NV12 planes to `recNNNN.yuv` and samples to `recNNNN.pcm`
pub struct RawDumpSink<'m, M: ?Sized> {
    mem: &'m M,
    dir: PathBuf,
    current: Option<Recording>,
    last_path: Option<PathBuf>,
}

impl<'m, M: GuestMemory + ?Sized> RawDumpSink<'m, M> {
    pub fn new(mem: &'m M, dir: &Path) -> Self {
        Self {
            mem,
            dir: dir.to_path_buf(),
            current: None,
            last_path: None,
        }
    }

    /// Video file of the current or most recent session
    pub fn last_path(&self) -> Option<&Path> {
        self.last_path.as_deref()
    }

    fn guest_bytes(&self, addr: Param, len: usize) -> Result<&'m [u8]> {
        self.mem.bytes(addr, len).map_err(|_| HostError::GuestBuffer {
            addr: addr as u64,
            len,
        })
    }

    fn recording(&mut self) -> Result<&mut Recording> {
        self.current.as_mut().ok_or_else(|| {
            HostError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no recording session",
            ))
        })
    }
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|source| HostError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufWriter::new(file))
}

impl<M: GuestMemory + ?Sized> FrameSink for RawDumpSink<'_, M> {
    fn begin(&mut self) -> Result<()> {
        let video_path = next_recording_path(&self.dir, "yuv")?;
        let audio_path = video_path.with_extension("pcm");
        self.current = Some(Recording {
            video: create(&video_path)?,
            audio: create(&audio_path)?,
        });
        log::info!("recording to {}", video_path.display());
        self.last_path = Some(video_path);
        Ok(())
    }

    fn audio(&mut self, frame: &FrameUpdate<AudioFrame>) -> Result<()> {
        let samples = self.guest_bytes(frame.desc.buffer, frame.desc.size as usize)?;
        self.recording()?.audio.write_all(samples)?;
        Ok(())
    }

    fn video(&mut self, frame: &FrameUpdate<VideoFrame>) -> Result<()> {
        let desc = frame.desc;
        let luma_len = desc.width as usize * desc.height as usize;
        let luma = self.guest_bytes(desc.luma, luma_len)?;
        let chroma = self.guest_bytes(desc.chroma, luma_len / 2)?;

        let out = &mut self.recording()?.video;
        out.write_all(luma)?;
        out.write_all(chroma)?;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        if let Some(mut recording) = self.current.take() {
            recording.video.flush()?;
            recording.audio.flush()?;
        }
        Ok(())
    }
}
