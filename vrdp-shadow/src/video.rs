// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Video stream detection
//!
//! A screen area that receives same sized bitmap updates at a steady pace is
//! treated as a video. The detector keeps a short history of update
//! rectangles; once one rectangle has been repeated often enough within the
//! detection window a source stream is offered to the [`VideoHandler`]. Later
//! updates of exactly that rectangle are reported as frames, which the
//! handler pulls through a [`VideoFrame`] instead of receiving copies.
//!
//! ```text
//!   bitmap update --> history --(N repeats)--> stream start
//!                                                   |
//!   bitmap update of stream rect ----------------> frame
//!   order over stream / no frames for a while ---> stream stop
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, info};

use crate::pixel::PixelFormat;
use crate::rect::Rect;
use crate::transform::TransBits;

const MIN_WIDTH: u32 = 64;
const MIN_HEIGHT: u32 = 64;
const MIN_AREA: u64 = 64 * 64;
const ASPECT_SCALE: u64 = 100;
const MIN_ASPECT: u64 = ASPECT_SCALE / 2;
const MAX_ASPECT: u64 = 3 * ASPECT_SCALE;
const COMMAND_QUEUE_LEN: usize = 64;

static NEXT_STREAM_ID: AtomicU32 = AtomicU32::new(0);

/// Process wide stream id, never 0
fn next_stream_id() -> u32 {
    loop {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if id != 0 {
            return id;
        }
    }
}

/// Outcome of offering a bitmap update to the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoVerdict {
    /// Regular screen update
    NotVideo,
    /// Part of a stream but too early; dropped from the stream
    Ignore,
    /// A frame of the given stream
    Frame(u32),
}

/// Commands posted by the output side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorCommand {
    Disable,
    Enable,
    Reset,
}

/// Lazily readable frame handed to [`VideoHandler::source_frame`]
pub struct VideoFrame<'a> {
    bits: &'a TransBits<'a>,
}

impl<'a> VideoFrame<'a> {
    pub fn new(bits: &'a TransBits<'a>) -> Self {
        Self { bits }
    }

    /// Frame area in shadow buffer coordinates
    pub fn rect(&self) -> Rect {
        self.bits.rect
    }

    /// Read the frame as packed 32 bits per pixel lines
    pub fn read_xrgb8888(&self) -> Vec<u8> {
        self.bits.to_packed(PixelFormat::Xrgb8888)
    }
}

/// Sink for detected video streams
pub trait VideoHandler: Send {
    /// A new source stream was detected. Returns whether it is accepted.
    fn stream_start(&mut self, stream_id: u32, rect: &Rect, timestamp_ms: u64) -> bool;

    fn stream_stop(&mut self, stream_id: u32, rect: &Rect);

    /// A frame of an accepted stream. Returns whether it was consumed.
    fn source_frame(&mut self, stream_id: u32, timestamp_ms: u64, frame: &VideoFrame<'_>) -> bool;
}

/// Handler used while none is registered: accepts no stream
pub struct NoVideoHandler;

impl VideoHandler for NoVideoHandler {
    fn stream_start(&mut self, _stream_id: u32, _rect: &Rect, _timestamp_ms: u64) -> bool {
        false
    }

    fn stream_stop(&mut self, _stream_id: u32, _rect: &Rect) {}

    fn source_frame(&mut self, _stream_id: u32, _timestamp_ms: u64, _frame: &VideoFrame<'_>) -> bool {
        false
    }
}

/// Forwards to another handler and remembers the areas of stopped streams
pub(crate) struct StopRecorder<'a> {
    handler: &'a mut dyn VideoHandler,
    stopped: Vec<Rect>,
}

impl<'a> StopRecorder<'a> {
    pub(crate) fn new(handler: &'a mut dyn VideoHandler) -> Self {
        Self {
            handler,
            stopped: Vec::new(),
        }
    }

    pub(crate) fn into_stopped(self) -> Vec<Rect> {
        self.stopped
    }
}

impl VideoHandler for StopRecorder<'_> {
    fn stream_start(&mut self, stream_id: u32, rect: &Rect, timestamp_ms: u64) -> bool {
        self.handler.stream_start(stream_id, rect, timestamp_ms)
    }

    fn stream_stop(&mut self, stream_id: u32, rect: &Rect) {
        self.handler.stream_stop(stream_id, rect);
        self.stopped.push(*rect);
    }

    fn source_frame(&mut self, stream_id: u32, timestamp_ms: u64, frame: &VideoFrame<'_>) -> bool {
        self.handler.source_frame(stream_id, timestamp_ms, frame)
    }
}

/// Per screen video detector
pub trait VideoDetector: Send {
    fn bitmap_update(&mut self, rect: &Rect, now_ms: u64, handler: &mut dyn VideoHandler) -> VideoVerdict;

    /// A drawing order touched `rect`
    fn order_update(&mut self, rect: &Rect, handler: &mut dyn VideoHandler);

    /// Periodic maintenance at the end of an update cycle
    fn update_complete(&mut self, now_ms: u64, handler: &mut dyn VideoHandler);

    fn reset(&mut self, stop_streams: bool, handler: &mut dyn VideoHandler);

    fn store_command(&mut self, command: DetectorCommand);
}

/// Detector that never finds a video
#[derive(Debug, Default)]
pub struct NullVideoDetector;

impl VideoDetector for NullVideoDetector {
    fn bitmap_update(&mut self, _rect: &Rect, _now_ms: u64, _handler: &mut dyn VideoHandler) -> VideoVerdict {
        VideoVerdict::NotVideo
    }

    fn order_update(&mut self, _rect: &Rect, _handler: &mut dyn VideoHandler) {}

    fn update_complete(&mut self, _now_ms: u64, _handler: &mut dyn VideoHandler) {}

    fn reset(&mut self, _stop_streams: bool, _handler: &mut dyn VideoHandler) {}

    fn store_command(&mut self, _command: DetectorCommand) {}
}

/// Detection thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Repeats needed before a stream starts
    pub detection_frames: u32,
    /// Repeats closer than this are ignored
    pub detection_min_ms: u64,
    /// Repeats further apart than this restart detection
    pub detection_max_ms: u64,
    /// How long history entries are kept
    pub history_decay_ms: u64,
    /// A stream without frames for this long is dropped
    pub video_decay_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            detection_frames: 10,
            detection_min_ms: 15,
            detection_max_ms: 300,
            history_decay_ms: 2000,
            video_decay_ms: 300,
        }
    }
}

#[derive(Debug, Clone)]
struct HistoryItem {
    rect: Rect,
    last_ms: u64,
    frames: u32,
}

#[derive(Debug, Clone)]
struct SourceStream {
    id: u32,
    rect: Rect,
    last_ms: u64,
}

/// History based detector
#[derive(Debug)]
pub struct HistoryVideoDetector {
    config: DetectorConfig,
    enabled: bool,
    /// Newest first
    history: Vec<HistoryItem>,
    streams: Vec<SourceStream>,
    commands: VecDeque<DetectorCommand>,
}

impl HistoryVideoDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            enabled: true,
            history: Vec::new(),
            streams: Vec::new(),
            commands: VecDeque::with_capacity(COMMAND_QUEUE_LEN),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn looks_like_video(rect: &Rect) -> bool {
        if rect.w < MIN_WIDTH || rect.h < MIN_HEIGHT || rect.area() < MIN_AREA {
            return false;
        }
        let aspect = u64::from(rect.w) * ASPECT_SCALE / u64::from(rect.h);
        (MIN_ASPECT..=MAX_ASPECT).contains(&aspect)
    }

    fn drop_streams(&mut self, handler: &mut dyn VideoHandler, mut pred: impl FnMut(&SourceStream) -> bool) {
        self.streams.retain(|stream| {
            if pred(stream) {
                info!("video stream {} at {} dropped", stream.id, stream.rect);
                handler.stream_stop(stream.id, &stream.rect);
                false
            } else {
                true
            }
        });
    }
}

impl Default for HistoryVideoDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl VideoDetector for HistoryVideoDetector {
    fn bitmap_update(&mut self, rect: &Rect, now_ms: u64, handler: &mut dyn VideoHandler) -> VideoVerdict {
        if !Self::looks_like_video(rect) || !self.enabled {
            return VideoVerdict::NotVideo;
        }

        if let Some(stream) = self.streams.iter_mut().find(|s| s.rect == *rect) {
            if now_ms.saturating_sub(stream.last_ms) > self.config.detection_min_ms {
                stream.last_ms = now_ms;
                return VideoVerdict::Frame(stream.id);
            }
            return VideoVerdict::Ignore;
        }

        let mut repeated = false;
        let mut i = 0;
        while i < self.history.len() {
            let item = &self.history[i];
            if item.rect == *rect {
                repeated = true;
                let delta = now_ms.saturating_sub(item.last_ms);
                if delta < self.config.detection_min_ms {
                    return VideoVerdict::NotVideo;
                }
                if delta >= self.config.detection_max_ms {
                    self.history.remove(i);
                    continue;
                }

                let mut item = self.history.remove(i);
                item.last_ms = now_ms;
                item.frames += 1;
                if item.frames >= self.config.detection_frames {
                    let id = next_stream_id();
                    if handler.stream_start(id, &item.rect, now_ms) {
                        info!("video stream {id} detected at {}", item.rect);
                        self.streams.insert(
                            0,
                            SourceStream {
                                id,
                                rect: item.rect,
                                last_ms: now_ms,
                            },
                        );
                    } else {
                        debug!("video stream at {} not accepted", item.rect);
                    }
                    // Only the next frame goes to the stream
                    return VideoVerdict::NotVideo;
                }
                self.history.insert(0, item);
                i += 1;
                continue;
            }

            if rect.contains_rect(&item.rect) && rect.w != item.rect.w && rect.h != item.rect.h {
                self.history.remove(i);
                continue;
            }
            i += 1;
        }

        if !repeated {
            self.history.insert(
                0,
                HistoryItem {
                    rect: *rect,
                    last_ms: now_ms,
                    frames: 0,
                },
            );
        }
        VideoVerdict::NotVideo
    }

    fn order_update(&mut self, rect: &Rect, handler: &mut dyn VideoHandler) {
        self.drop_streams(handler, |stream| stream.rect.intersect(rect).is_some());
        self.history.retain(|item| item.rect.intersect(rect).is_none());
    }

    fn update_complete(&mut self, now_ms: u64, handler: &mut dyn VideoHandler) {
        let video_decay = self.config.video_decay_ms;
        self.drop_streams(handler, |stream| now_ms.saturating_sub(stream.last_ms) > video_decay);

        let history_decay = self.config.history_decay_ms;
        self.history
            .retain(|item| now_ms.saturating_sub(item.last_ms) <= history_decay);

        match self.commands.pop_front() {
            Some(DetectorCommand::Disable) => {
                if self.enabled {
                    self.enabled = false;
                    self.reset(true, handler);
                }
            }
            Some(DetectorCommand::Enable) => self.enabled = true,
            Some(DetectorCommand::Reset) => self.reset(true, handler),
            None => {}
        }
    }

    fn reset(&mut self, stop_streams: bool, handler: &mut dyn VideoHandler) {
        for stream in self.streams.drain(..) {
            if stop_streams {
                handler.stream_stop(stream.id, &stream.rect);
            }
        }
        self.history.clear();
    }

    fn store_command(&mut self, command: DetectorCommand) {
        if self.commands.len() == COMMAND_QUEUE_LEN {
            self.commands.pop_front();
        }
        self.commands.push_back(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        accept: bool,
        started: Vec<u32>,
        stopped: Vec<u32>,
    }

    impl VideoHandler for Recorder {
        fn stream_start(&mut self, stream_id: u32, _rect: &Rect, _timestamp_ms: u64) -> bool {
            self.started.push(stream_id);
            self.accept
        }

        fn stream_stop(&mut self, stream_id: u32, _rect: &Rect) {
            self.stopped.push(stream_id);
        }

        fn source_frame(&mut self, _stream_id: u32, _timestamp_ms: u64, _frame: &VideoFrame<'_>) -> bool {
            true
        }
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            detection_frames: 3,
            ..Default::default()
        }
    }

    fn feed(detector: &mut HistoryVideoDetector, rect: &Rect, handler: &mut Recorder, times: &[u64]) -> Vec<VideoVerdict> {
        times
            .iter()
            .map(|&t| detector.bitmap_update(rect, t, handler))
            .collect()
    }

    #[test]
    fn test_small_rects_ignored() {
        let mut detector = HistoryVideoDetector::new(config());
        let mut handler = Recorder::default();
        let verdict = detector.bitmap_update(&Rect::new(0, 0, 32, 32), 0, &mut handler);
        assert_eq!(verdict, VideoVerdict::NotVideo);
        assert_eq!(detector.history_len(), 0);

        // Too wide
        detector.bitmap_update(&Rect::new(0, 0, 640, 64), 0, &mut handler);
        assert_eq!(detector.history_len(), 0);
    }

    #[test]
    fn test_detects_stream_and_frames() {
        let mut detector = HistoryVideoDetector::new(config());
        let mut handler = Recorder {
            accept: true,
            ..Default::default()
        };
        let rect = Rect::new(100, 100, 320, 240);
        let verdicts = feed(&mut detector, &rect, &mut handler, &[0, 40, 80, 120]);
        assert!(verdicts.iter().all(|v| *v == VideoVerdict::NotVideo));
        assert_eq!(handler.started.len(), 1);
        assert_eq!(detector.stream_count(), 1);

        let id = handler.started[0];
        assert_eq!(detector.bitmap_update(&rect, 160, &mut handler), VideoVerdict::Frame(id));
        // Too soon after the previous frame
        assert_eq!(detector.bitmap_update(&rect, 165, &mut handler), VideoVerdict::Ignore);
    }

    #[test]
    fn test_rejected_stream_is_not_tracked() {
        let mut detector = HistoryVideoDetector::new(config());
        let mut handler = Recorder::default();
        let rect = Rect::new(0, 0, 320, 240);
        feed(&mut detector, &rect, &mut handler, &[0, 40, 80, 120]);
        assert_eq!(handler.started.len(), 1);
        assert_eq!(detector.stream_count(), 0);
    }

    #[test]
    fn test_order_and_decay_drop_streams() {
        let mut detector = HistoryVideoDetector::new(config());
        let mut handler = Recorder {
            accept: true,
            ..Default::default()
        };
        let rect = Rect::new(0, 0, 320, 240);
        feed(&mut detector, &rect, &mut handler, &[0, 40, 80, 120]);
        detector.order_update(&Rect::new(10, 10, 5, 5), &mut handler);
        assert_eq!(detector.stream_count(), 0);
        assert_eq!(handler.stopped, handler.started);

        feed(&mut detector, &rect, &mut handler, &[200, 240, 280, 320]);
        assert_eq!(detector.stream_count(), 1);
        detector.update_complete(1000, &mut handler);
        assert_eq!(detector.stream_count(), 0);
        assert_eq!(handler.stopped.len(), 2);
    }

    #[test]
    fn test_disable_command() {
        let mut detector = HistoryVideoDetector::new(config());
        let mut handler = Recorder::default();
        detector.store_command(DetectorCommand::Disable);
        detector.update_complete(0, &mut handler);
        let rect = Rect::new(0, 0, 320, 240);
        detector.bitmap_update(&rect, 10, &mut handler);
        assert_eq!(detector.history_len(), 0);

        detector.store_command(DetectorCommand::Enable);
        detector.update_complete(20, &mut handler);
        detector.bitmap_update(&rect, 30, &mut handler);
        assert_eq!(detector.history_len(), 1);
    }
}
