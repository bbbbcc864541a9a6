//! Camera capture and MJPG encoding through `ffmpeg` child processes.
//!
//! The camera child decodes the device to raw `bgr24` frames on stdout; the
//! encoder child reads the same raw frames on stdin and writes an MJPG AVI.

use super::{CapturedFrame, FrameSource, FrameWriter};
use crate::errors::CuesyncError;
use crate::logging::append_run_log;
use serde_json::json;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

const BYTES_PER_PIXEL: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub input_format: String,
    pub device: String,
    /// `WxH`; when unset the device default is probed.
    pub video_size: Option<String>,
    /// Rate requested from the device; `None` keeps the device default.
    pub requested_fps: Option<f64>,
}

impl CameraSettings {
    /// `/dev/video<id>` under v4l2, the bare index under avfoundation.
    pub fn for_camera(camera_id: &str, input_format: &str) -> Self {
        let device = if input_format == "v4l2" && camera_id.chars().all(|c| c.is_ascii_digit()) {
            format!("/dev/video{camera_id}")
        } else {
            camera_id.to_string()
        };
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            input_format: input_format.to_string(),
            device,
            video_size: None,
            requested_fps: None,
        }
    }

    fn input_args(&self) -> Vec<String> {
        let mut args = vec!["-f".to_string(), self.input_format.clone()];
        if let Some(fps) = self.requested_fps.filter(|fps| *fps > 0.0) {
            args.push("-framerate".to_string());
            args.push(fps.to_string());
        }
        if let Some(size) = &self.video_size {
            args.push("-video_size".to_string());
            args.push(size.clone());
        }
        args.push("-i".to_string());
        args.push(self.device.clone());
        args
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbedStream {
    pub width: u32,
    pub height: u32,
    pub fps: Option<f64>,
}

pub fn probe_camera(settings: &CameraSettings) -> Result<ProbedStream, CuesyncError> {
    let mut args = vec![
        "-v".to_string(),
        "error".to_string(),
        "-select_streams".to_string(),
        "v:0".to_string(),
        "-show_entries".to_string(),
        "stream=width,height,r_frame_rate".to_string(),
        "-of".to_string(),
        "csv=p=0".to_string(),
    ];
    args.extend(settings.input_args());

    let output = Command::new(&settings.ffprobe)
        .args(&args)
        .output()
        .map_err(|e| CuesyncError::Capture(format!("failed to run {}: {e}", settings.ffprobe)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CuesyncError::Capture(format!(
            "could not open camera {}: {}",
            settings.device,
            stderr.trim()
        )));
    }
    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parses `width,height,r_frame_rate` where the rate is `num/den` or a plain number.
pub fn parse_probe_output(stdout: &str) -> Result<ProbedStream, CuesyncError> {
    let line = stdout.lines().find(|line| !line.trim().is_empty()).unwrap_or("");
    let parts: Vec<&str> = line.trim().split(',').collect();
    if parts.len() < 3 {
        return Err(CuesyncError::Capture(format!(
            "unexpected ffprobe output: {stdout}"
        )));
    }
    let width: u32 = parts[0]
        .parse()
        .map_err(|_| CuesyncError::Capture(format!("invalid width {:?}", parts[0])))?;
    let height: u32 = parts[1]
        .parse()
        .map_err(|_| CuesyncError::Capture(format!("invalid height {:?}", parts[1])))?;
    let fps = match parts[2].split_once('/') {
        Some((num, den)) => match (num.parse::<f64>(), den.parse::<f64>()) {
            (Ok(num), Ok(den)) if den > 0.0 => Some(num / den),
            _ => None,
        },
        None => parts[2].parse::<f64>().ok(),
    }
    .filter(|fps| *fps > 0.0);
    Ok(ProbedStream { width, height, fps })
}

pub struct FfmpegCameraSource {
    process: Child,
    stdout: BufReader<ChildStdout>,
    width: u32,
    height: u32,
    frame_size: usize,
    reported_fps: Option<f64>,
}

impl FfmpegCameraSource {
    pub fn open(settings: &CameraSettings) -> Result<Self, CuesyncError> {
        let probed = probe_camera(settings)?;
        append_run_log(
            "info",
            "capture.camera.probed",
            json!({
                "device": settings.device,
                "width": probed.width,
                "height": probed.height,
                "fps": probed.fps,
            }),
        );

        let mut args = vec!["-hide_banner".to_string(), "-loglevel".to_string(), "error".to_string()];
        args.extend(settings.input_args());
        args.extend([
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "bgr24".to_string(),
            "-s".to_string(),
            format!("{}x{}", probed.width, probed.height),
            "-".to_string(),
        ]);

        let mut process = Command::new(&settings.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CuesyncError::Capture(format!("failed to start camera reader: {e}")))?;
        let frame_size = (probed.width * probed.height * BYTES_PER_PIXEL) as usize;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| CuesyncError::Capture("camera reader has no stdout".to_string()))?;

        Ok(Self {
            process,
            stdout: BufReader::with_capacity(frame_size * 2, stdout),
            width: probed.width,
            height: probed.height,
            frame_size,
            reported_fps: probed.fps,
        })
    }
}

impl FrameSource for FfmpegCameraSource {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn reported_fps(&self) -> Option<f64> {
        self.reported_fps
    }

    fn capture(&mut self) -> Result<CapturedFrame, CuesyncError> {
        let mut data = vec![0_u8; self.frame_size];
        self.stdout.read_exact(&mut data).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                CuesyncError::Capture("failed to grab frame: camera stream ended".to_string())
            } else {
                CuesyncError::Capture(format!("failed to grab frame: {e}"))
            }
        })?;
        Ok(CapturedFrame {
            width: self.width,
            height: self.height,
            data,
        })
    }
}

impl Drop for FfmpegCameraSource {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

pub struct MjpegFileWriter {
    process: Child,
    stdin: Option<ChildStdin>,
    output_path: PathBuf,
    frames: u64,
}

impl MjpegFileWriter {
    pub fn create(
        ffmpeg: &str,
        output_path: &Path,
        width: u32,
        height: u32,
        fps: f64,
    ) -> Result<Self, CuesyncError> {
        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CuesyncError::Io(e.to_string()))?;
            }
        }
        let args = [
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "bgr24".to_string(),
            "-s".to_string(),
            format!("{width}x{height}"),
            "-r".to_string(),
            fps.to_string(),
            "-i".to_string(),
            "-".to_string(),
            "-c:v".to_string(),
            "mjpeg".to_string(),
            "-q:v".to_string(),
            "3".to_string(),
            output_path.display().to_string(),
        ];
        append_run_log(
            "info",
            "capture.encoder.starting",
            json!({ "output": output_path.display().to_string(), "fps": fps }),
        );
        let mut process = Command::new(ffmpeg)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CuesyncError::Capture(format!("failed to start encoder: {e}")))?;
        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| CuesyncError::Capture("encoder has no stdin".to_string()))?;
        Ok(Self {
            process,
            stdin: Some(stdin),
            output_path: output_path.to_path_buf(),
            frames: 0,
        })
    }
}

impl FrameWriter for MjpegFileWriter {
    fn write_frame(&mut self, frame: &CapturedFrame) -> Result<(), CuesyncError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| CuesyncError::Capture("encoder already finished".to_string()))?;
        stdin
            .write_all(&frame.data)
            .map_err(|e| CuesyncError::Capture(format!("encoder write failed: {e}")))?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), CuesyncError> {
        let Some(stdin) = self.stdin.take() else {
            return Ok(());
        };
        drop(stdin);
        let status = self
            .process
            .wait()
            .map_err(|e| CuesyncError::Capture(format!("encoder wait failed: {e}")))?;
        if !status.success() {
            return Err(CuesyncError::Capture(format!(
                "encoder exited with {status} after {} frames",
                self.frames
            )));
        }
        println!("[INFO] Video saved to {}", self.output_path.display());
        Ok(())
    }
}

impl Drop for MjpegFileWriter {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            let _ = self.process.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_output_parses_rational_rate() {
        let probed = parse_probe_output("640,480,30000/1001\n").expect("parse");
        assert_eq!((probed.width, probed.height), (640, 480));
        let fps = probed.fps.expect("fps");
        assert!((fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn probe_output_with_zero_rate_reports_none() {
        let probed = parse_probe_output("1280,720,0/0").expect("parse");
        assert_eq!(probed.fps, None);
        assert!(parse_probe_output("garbage").is_err());
    }

    #[test]
    fn numeric_camera_id_maps_to_v4l2_device() {
        assert_eq!(CameraSettings::for_camera("2", "v4l2").device, "/dev/video2");
        assert_eq!(CameraSettings::for_camera("0", "avfoundation").device, "0");
    }
}
