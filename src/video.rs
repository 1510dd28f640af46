//! Video probing and frame sampling through the `ffprobe`/`ffmpeg` executables.

use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SpriteCullError};
use crate::progress_tracker::CancelFlag;

const TIME_EPSILON: f64 = 1e-9;
/// Bytes of tool stderr kept for error messages.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: u64,
    pub duration: f64,
    #[serde(default)]
    pub codec: String,
}

impl VideoInfo {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// `HH:MM:SS.mmm`
    pub fn format_duration(&self) -> String {
        format_timestamp(self.duration)
    }

    fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

pub fn format_timestamp(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    let hours = (seconds / 3600.0).floor() as u64;
    let minutes = ((seconds % 3600.0) / 60.0).floor() as u64;
    let secs = seconds % 60.0;
    format!("{:02}:{:02}:{:06.3}", hours, minutes, secs)
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    codec_name: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

fn parse_rate(rate: &str) -> f64 {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().unwrap_or(0.0);
            let den: f64 = den.trim().parse().unwrap_or(0.0);
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => rate.trim().parse().unwrap_or(0.0),
    }
}

/// Builds [`VideoInfo`] from `ffprobe -of json` output.
pub fn parse_probe_output(path: &Path, json: &str) -> Result<VideoInfo> {
    let probe: ProbeOutput = serde_json::from_str(json).map_err(|e| SpriteCullError::Video {
        path: path.to_path_buf(),
        reason: format!("unreadable ffprobe output: {}", e),
    })?;

    let stream = probe
        .streams
        .into_iter()
        .find(|s| s.width.is_some() && s.height.is_some())
        .ok_or_else(|| SpriteCullError::Video {
            path: path.to_path_buf(),
            reason: "no video stream".to_string(),
        })?;

    let fps = stream.r_frame_rate.as_deref().map(parse_rate).unwrap_or(0.0);
    let reported_duration = stream
        .duration
        .as_deref()
        .or(probe.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or_else(|| (reported_duration * fps).round() as u64);
    let duration = if fps > 0.0 {
        frame_count as f64 / fps
    } else {
        0.0
    };

    Ok(VideoInfo {
        path: path.to_path_buf(),
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        fps,
        frame_count,
        duration,
        codec: stream.codec_name.unwrap_or_default(),
    })
}

pub(crate) fn spawn_error(tool: &Path, operation: &str, err: std::io::Error) -> SpriteCullError {
    let reason = if err.kind() == ErrorKind::NotFound {
        "executable not found".to_string()
    } else {
        err.to_string()
    };
    SpriteCullError::ExternalTool {
        tool: tool.display().to_string(),
        operation: operation.to_string(),
        reason,
    }
}

/// Reads stream metadata with `ffprobe`.
pub fn probe(ffprobe: &Path, path: &Path) -> Result<VideoInfo> {
    if !path.exists() {
        return Err(SpriteCullError::fs(
            path,
            "open video",
            std::io::Error::new(ErrorKind::NotFound, "video file does not exist"),
        ));
    }

    let output = Command::new(ffprobe)
        .args(["-v", "error", "-select_streams", "v:0"])
        .args([
            "-show_entries",
            "stream=width,height,r_frame_rate,nb_frames,codec_name,duration:format=duration",
        ])
        .args(["-of", "json"])
        .arg(path)
        .output()
        .map_err(|e| spawn_error(ffprobe, "probe", e))?;

    if !output.status.success() {
        return Err(SpriteCullError::Video {
            path: path.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let info = parse_probe_output(path, &String::from_utf8_lossy(&output.stdout))?;
    tracing::debug!(
        "probed {}: {} @ {:.3} fps, {} frames",
        path.display(),
        info.resolution(),
        info.fps,
        info.frame_count
    );
    Ok(info)
}

fn check_range(start: f64, end: f64, fps: f64) -> Result<()> {
    if !(fps > 0.0) {
        return Err(SpriteCullError::validation("fps", "must be greater than zero"));
    }
    if start < 0.0 || end < start {
        return Err(SpriteCullError::validation(
            "time range",
            format!("invalid range {:.3}..{:.3}", start, end),
        ));
    }
    Ok(())
}

/// Sample times `start + i / fps` up to and including `end`.
pub fn sample_timestamps(start: f64, end: f64, fps: f64) -> Result<Vec<f64>> {
    check_range(start, end, fps)?;
    let mut timestamps = Vec::new();
    let mut i = 0u64;
    loop {
        let t = start + i as f64 / fps;
        if t > end + TIME_EPSILON {
            break;
        }
        timestamps.push(t);
        i += 1;
    }
    Ok(timestamps)
}

pub fn frame_count_in_range(start: f64, end: f64, fps: f64) -> usize {
    (((end - start) * fps).floor() as i64).max(1) as usize
}

/// One sampled frame as decoded from the video.
#[derive(Debug, Clone)]
pub struct ExtractedFrame {
    pub index: usize,
    pub timestamp: f64,
    pub image: RgbImage,
}

/// Samples frames by streaming raw RGB out of a single `ffmpeg` process.
#[derive(Debug, Clone)]
pub struct FrameExtractor {
    ffmpeg: PathBuf,
}

impl FrameExtractor {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    /// Decodes `start..=end` at `fps` samples per second and hands each frame
    /// to `on_frame` as soon as it arrives. Returns the number of frames
    /// delivered, which is short of the plan when cancelled or when the
    /// stream ends early.
    pub fn extract<F>(
        &self,
        info: &VideoInfo,
        start: f64,
        end: f64,
        fps: f64,
        cancel: &CancelFlag,
        on_frame: F,
    ) -> Result<usize>
    where
        F: FnMut(ExtractedFrame) -> Result<()>,
    {
        let timestamps = sample_timestamps(start, end, fps)?;
        if info.width == 0 || info.height == 0 {
            return Err(SpriteCullError::Video {
                path: info.path.clone(),
                reason: "video has no frame size".to_string(),
            });
        }

        let span = end - start + 1.0 / fps;
        let mut child = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-nostdin"])
            .args(["-ss", &format!("{:.6}", start)])
            .arg("-i")
            .arg(&info.path)
            .args(["-t", &format!("{:.6}", span)])
            .args(["-vf", &format!("fps={}", fps)])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.ffmpeg, "extract frames", e))?;

        let stderr = child.stderr.take().map(collect_stderr);
        let delivered = match child.stdout.take() {
            Some(stdout) => read_frames(stdout, info, &timestamps, cancel, on_frame),
            None => Err(self.tool_error("extract frames", "stdout not captured".to_string())),
        };
        // Past EOF the process is already on its way out, so wait for its status.
        let stream_ended =
            matches!(delivered, Ok(n) if n < timestamps.len()) && !cancel.is_cancelled();
        let status = if stream_ended {
            child.wait().ok()
        } else {
            finish(&mut child)
        };
        let stderr = stderr
            .and_then(|handle| handle.join().ok())
            .map(|bytes| stderr_tail(&bytes))
            .unwrap_or_default();
        let delivered = delivered?;

        if stream_ended {
            if let Some(status) = status.filter(|s| !s.success()) {
                return Err(self.tool_error(
                    "extract frames",
                    failure_reason(&format!("exited with {}", status), &stderr),
                ));
            }
            if delivered == 0 {
                return Err(SpriteCullError::Video {
                    path: info.path.clone(),
                    reason: failure_reason("ffmpeg decoded no frames", &stderr),
                });
            }
        }

        tracing::info!(
            "extracted {}/{} frames from {}",
            delivered,
            timestamps.len(),
            info.path.display()
        );
        Ok(delivered)
    }

    fn tool_error(&self, operation: &str, reason: String) -> SpriteCullError {
        SpriteCullError::ExternalTool {
            tool: self.ffmpeg.display().to_string(),
            operation: operation.to_string(),
            reason,
        }
    }

    /// Decodes the frame shown at `timestamp`, or `None` past the end of the stream.
    pub fn extract_single(&self, info: &VideoInfo, timestamp: f64) -> Result<Option<RgbImage>> {
        let frame_bytes = info.frame_bytes();
        if frame_bytes == 0 {
            return Err(SpriteCullError::Video {
                path: info.path.clone(),
                reason: "video has no frame size".to_string(),
            });
        }

        let output = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-nostdin"])
            .args(["-ss", &format!("{:.6}", timestamp.max(0.0))])
            .arg("-i")
            .arg(&info.path)
            .args(["-frames:v", "1"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .output()
            .map_err(|e| spawn_error(&self.ffmpeg, "extract frame", e))?;

        if !output.status.success() {
            return Err(self.tool_error(
                "extract frame",
                failure_reason(
                    &format!("exited with {}", output.status),
                    &stderr_tail(&output.stderr),
                ),
            ));
        }
        if output.stdout.len() < frame_bytes {
            tracing::debug!("no frame at {}", format_timestamp(timestamp));
            return Ok(None);
        }
        let mut data = output.stdout;
        data.truncate(frame_bytes);
        Ok(RgbImage::from_raw(info.width, info.height, data))
    }
}

/// Reaps the child. `None` when it was still running and had to be killed.
fn finish(child: &mut Child) -> Option<ExitStatus> {
    match child.try_wait() {
        Ok(Some(status)) => Some(status),
        _ => {
            // The pipe may still hold frames past the planned range.
            let _ = child.kill();
            let _ = child.wait();
            None
        }
    }
}

fn collect_stderr(mut stderr: ChildStderr) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = stderr.read_to_end(&mut buffer);
        buffer
    })
}

/// Last [`STDERR_TAIL`] bytes of tool output, trimmed.
fn stderr_tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    let cut = text.len().saturating_sub(STDERR_TAIL);
    let start = text
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| i >= cut)
        .unwrap_or(text.len());
    text[start..].to_string()
}

fn failure_reason(summary: &str, stderr: &str) -> String {
    if stderr.is_empty() {
        summary.to_string()
    } else {
        format!("{}: {}", summary, stderr)
    }
}

/// Splits a raw rgb24 stream into frames matched to `timestamps` in order.
fn read_frames<R, F>(
    mut reader: R,
    info: &VideoInfo,
    timestamps: &[f64],
    cancel: &CancelFlag,
    mut on_frame: F,
) -> Result<usize>
where
    R: Read,
    F: FnMut(ExtractedFrame) -> Result<()>,
{
    let frame_bytes = info.frame_bytes();
    let mut delivered = 0;

    for (index, &timestamp) in timestamps.iter().enumerate() {
        if cancel.is_cancelled() {
            tracing::info!("extraction cancelled after {} frames", delivered);
            break;
        }

        let mut buffer = vec![0u8; frame_bytes];
        match reader.read_exact(&mut buffer) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                tracing::debug!("stream ended after {} frames", delivered);
                break;
            }
            Err(e) => return Err(SpriteCullError::fs(&info.path, "read decoded frames", e)),
        }

        let image = RgbImage::from_raw(info.width, info.height, buffer).ok_or_else(|| {
            SpriteCullError::Video {
                path: info.path.clone(),
                reason: "decoded frame has unexpected size".to_string(),
            }
        })?;
        on_frame(ExtractedFrame {
            index,
            timestamp,
            image,
        })?;
        delivered += 1;
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn info(width: u32, height: u32) -> VideoInfo {
        VideoInfo {
            path: PathBuf::from("clip.mp4"),
            width,
            height,
            fps: 30.0,
            frame_count: 90,
            duration: 3.0,
            codec: "h264".to_string(),
        }
    }

    #[test]
    fn test_parse_probe_output() -> Result<()> {
        let json = r#"{
            "streams": [{
                "width": 1920, "height": 1080, "codec_name": "h264",
                "r_frame_rate": "30000/1001", "nb_frames": "300"
            }],
            "format": { "duration": "10.01" }
        }"#;
        let info = parse_probe_output(Path::new("a.mp4"), json)?;
        assert_eq!(info.resolution(), "1920x1080");
        assert!((info.fps - 29.97).abs() < 0.01);
        assert_eq!(info.frame_count, 300);
        assert!((info.duration - 300.0 / info.fps).abs() < 1e-9);
        assert_eq!(info.codec, "h264");
        Ok(())
    }

    #[test]
    fn test_parse_probe_output_derives_frame_count() -> Result<()> {
        let json = r#"{
            "streams": [{ "width": 64, "height": 48, "r_frame_rate": "25/1" }],
            "format": { "duration": "2.0" }
        }"#;
        let info = parse_probe_output(Path::new("a.webm"), json)?;
        assert_eq!(info.frame_count, 50);
        assert_eq!(info.duration, 2.0);

        let zero_rate = r#"{ "streams": [{ "width": 64, "height": 48, "r_frame_rate": "0/0" }] }"#;
        let info = parse_probe_output(Path::new("a.webm"), zero_rate)?;
        assert_eq!(info.duration, 0.0);
        Ok(())
    }

    #[test]
    fn test_parse_probe_output_without_video() {
        let json = r#"{ "streams": [{ "codec_name": "aac" }] }"#;
        assert!(matches!(
            parse_probe_output(Path::new("a.m4a"), json),
            Err(SpriteCullError::Video { .. })
        ));
    }

    #[test]
    fn test_probe_missing_file() {
        let result = probe(Path::new("ffprobe"), Path::new("/definitely/not/here.mp4"));
        assert!(matches!(result, Err(SpriteCullError::FileSystem { .. })));
    }

    #[test]
    fn test_sample_timestamps_inclusive() -> Result<()> {
        let ts = sample_timestamps(1.0, 2.0, 10.0)?;
        assert_eq!(ts.len(), 11);
        assert_eq!(ts[0], 1.0);
        assert!((ts[10] - 2.0).abs() < 1e-9);

        assert_eq!(sample_timestamps(0.0, 0.0, 5.0)?, vec![0.0]);
        assert!(sample_timestamps(0.0, 1.0, 0.0).is_err());
        assert!(sample_timestamps(2.0, 1.0, 10.0).is_err());
        Ok(())
    }

    #[test]
    fn test_frame_count_in_range() {
        assert_eq!(frame_count_in_range(0.0, 2.0, 10.0), 20);
        assert_eq!(frame_count_in_range(0.0, 0.05, 10.0), 1);
        assert_eq!(frame_count_in_range(1.0, 1.0, 10.0), 1);
    }

    #[test]
    fn test_format_duration() {
        let mut video = info(2, 2);
        video.duration = 3725.5;
        assert_eq!(video.format_duration(), "01:02:05.500");
        assert_eq!(format_timestamp(0.0), "00:00:00.000");
    }

    #[test]
    fn test_read_frames_assigns_timestamps() -> Result<()> {
        let video = info(2, 1);
        let mut raw = vec![10u8; 6];
        raw.extend(vec![20u8; 6]);
        raw.extend(vec![30u8; 6]);

        let mut frames = Vec::new();
        let delivered = read_frames(
            Cursor::new(raw),
            &video,
            &[0.0, 0.5],
            &CancelFlag::new(),
            |frame| {
                frames.push(frame);
                Ok(())
            },
        )?;

        assert_eq!(delivered, 2);
        assert_eq!(frames[1].index, 1);
        assert_eq!(frames[1].timestamp, 0.5);
        assert_eq!(frames[1].image.get_pixel(1, 0).0, [20, 20, 20]);
        Ok(())
    }

    #[test]
    fn test_stderr_tail_keeps_the_end() {
        let mut noise = "x".repeat(STDERR_TAIL * 2);
        noise.push_str("Invalid data found when processing input\n");
        let tail = stderr_tail(noise.as_bytes());
        assert!(tail.len() <= STDERR_TAIL);
        assert!(tail.ends_with("processing input"));
        assert_eq!(failure_reason("exited with 1", ""), "exited with 1");
        assert_eq!(failure_reason("exited with 1", "boom"), "exited with 1: boom");
    }

    #[test]
    fn test_extract_with_missing_ffmpeg() {
        let extractor = FrameExtractor::new("/definitely/not/ffmpeg");
        let result = extractor.extract(&info(4, 4), 0.0, 1.0, 5.0, &CancelFlag::new(), |_| Ok(()));
        assert!(matches!(result, Err(SpriteCullError::ExternalTool { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_ffmpeg_is_an_error() {
        // `false` exits 1 without writing a byte
        let extractor = FrameExtractor::new("false");
        let result = extractor.extract(&info(4, 4), 0.0, 1.0, 5.0, &CancelFlag::new(), |_| Ok(()));
        assert!(matches!(result, Err(SpriteCullError::ExternalTool { .. })));

        let single = extractor.extract_single(&info(4, 4), 0.5);
        assert!(matches!(single, Err(SpriteCullError::ExternalTool { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_silent_ffmpeg_without_frames_is_an_error() {
        // `true` exits 0 but produces no frames
        let extractor = FrameExtractor::new("true");
        let result = extractor.extract(&info(4, 4), 0.0, 1.0, 5.0, &CancelFlag::new(), |_| Ok(()));
        assert!(matches!(result, Err(SpriteCullError::Video { .. })));

        assert!(extractor.extract_single(&info(4, 4), 0.5).unwrap().is_none());
    }

    #[test]
    fn test_read_frames_short_stream_and_cancel() -> Result<()> {
        let video = info(2, 1);
        let raw = vec![1u8; 9];
        let delivered = read_frames(Cursor::new(raw), &video, &[0.0, 0.1, 0.2], &CancelFlag::new(), |_| Ok(()))?;
        assert_eq!(delivered, 1);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let delivered = read_frames(Cursor::new(vec![0u8; 12]), &video, &[0.0, 0.1], &cancel, |_| Ok(()))?;
        assert_eq!(delivered, 0);
        Ok(())
    }
}
