/// Encoder Driver
///
/// Wraps an external `ffmpeg` binary: builds a command for one target
/// resolution, runs it asynchronously, parses `-progress pipe:1` output
/// into progress events, and supervises the child process with a
/// heartbeat that escalates to SIGTERM then SIGKILL if ffmpeg stops
/// emitting progress.
use crate::error::{AppError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Resolution name, target width/height, and video/audio bitrate, ordered
/// ascending so master-playlist generation never has to sort.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionSpec {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

pub const RESOLUTION_TABLE: [ResolutionSpec; 4] = [
    ResolutionSpec {
        name: "360p",
        width: 640,
        height: 360,
        video_bitrate_kbps: 800,
        audio_bitrate_kbps: 96,
    },
    ResolutionSpec {
        name: "480p",
        width: 854,
        height: 480,
        video_bitrate_kbps: 1400,
        audio_bitrate_kbps: 128,
    },
    ResolutionSpec {
        name: "720p",
        width: 1280,
        height: 720,
        video_bitrate_kbps: 2800,
        audio_bitrate_kbps: 128,
    },
    ResolutionSpec {
        name: "1080p",
        width: 1920,
        height: 1080,
        video_bitrate_kbps: 5000,
        audio_bitrate_kbps: 192,
    },
];

pub fn resolution_spec(name: &str) -> Option<ResolutionSpec> {
    RESOLUTION_TABLE.iter().copied().find(|r| r.name == name)
}

/// A single progress update parsed from ffmpeg's `-progress pipe:1`
/// stream for one resolution's encode.
#[derive(Debug, Clone)]
pub struct EncodeProgress {
    pub resolution: &'static str,
    pub percent: i32,
}

/// Encode `input_path` into an HLS variant (playlist + segments) for one
/// resolution, writing into `output_dir`. Progress updates are sent on
/// `progress_tx`; the caller is expected to drive a heartbeat timeout
/// against them via `supervise`.
pub async fn encode_resolution(
    input_path: &Path,
    output_dir: &Path,
    duration_secs: f64,
    spec: ResolutionSpec,
    preset: &str,
    cpu_threads: Option<u32>,
    progress_tx: mpsc::Sender<EncodeProgress>,
    heartbeat: Duration,
    kill_grace: Duration,
) -> Result<()> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|e| AppError::Internal(format!("failed to create output dir: {e}")))?;

    let playlist_path = output_dir.join("index.m3u8");
    let segment_pattern = output_dir.join("segment%03d.ts");

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-i")
        .arg(input_path)
        .arg("-vf")
        .arg(format!("scale=w={}:h={}", spec.width, spec.height))
        .arg("-c:v")
        .arg("libx264")
        .arg("-preset")
        .arg(preset)
        .arg("-b:v")
        .arg(format!("{}k", spec.video_bitrate_kbps))
        .arg("-c:a")
        .arg("aac")
        .arg("-b:a")
        .arg(format!("{}k", spec.audio_bitrate_kbps))
        .arg("-f")
        .arg("hls")
        .arg("-hls_time")
        .arg("15")
        .arg("-hls_list_size")
        .arg("0")
        .arg("-hls_playlist_type")
        .arg("vod")
        .arg("-hls_segment_type")
        .arg("mpegts")
        .arg("-hls_segment_filename")
        .arg(&segment_pattern)
        .arg("-progress")
        .arg("pipe:1")
        .arg("-nostats")
        .arg(&playlist_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(threads) = cpu_threads {
        cmd.arg("-threads").arg(threads.to_string());
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| AppError::EncoderError {
            resolution: spec.name.to_string(),
            detail: format!("failed to spawn ffmpeg: {e}"),
        })?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let stderr_tail = spawn_stderr_collector(stderr);

    let progress_result = supervise_progress(
        &mut child,
        stdout,
        duration_secs,
        spec.name,
        progress_tx,
        heartbeat,
        kill_grace,
    )
    .await;

    let status = child
        .wait()
        .await
        .map_err(|e| AppError::EncoderError {
            resolution: spec.name.to_string(),
            detail: format!("failed to wait on ffmpeg: {e}"),
        })?;

    progress_result?;

    if !status.success() {
        let tail = stderr_tail.await.unwrap_or_default();
        return Err(AppError::EncoderError {
            resolution: spec.name.to_string(),
            detail: tail,
        });
    }

    Ok(())
}

fn spawn_stderr_collector(stderr: tokio::process::ChildStderr) -> tokio::task::JoinHandle<String> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        let mut tail = Vec::new();
        while let Ok(Some(line)) = reader.next_line().await {
            tail.push(line);
            if tail.len() > 40 {
                tail.remove(0);
            }
        }
        tail.join("\n")
    })
}

/// Read `-progress pipe:1` key=value lines from stdout, converting
/// `out_time_ms` into a percent-complete figure, and kill the child if no
/// line arrives within `heartbeat`.
async fn supervise_progress(
    child: &mut Child,
    stdout: tokio::process::ChildStdout,
    duration_secs: f64,
    resolution: &'static str,
    progress_tx: mpsc::Sender<EncodeProgress>,
    heartbeat: Duration,
    kill_grace: Duration,
) -> Result<()> {
    let mut reader = BufReader::new(stdout).lines();
    let mut missed_heartbeats = 0u32;

    loop {
        let line = match tokio::time::timeout(heartbeat, reader.next_line()).await {
            Ok(Ok(Some(line))) => {
                missed_heartbeats = 0;
                line
            }
            Ok(Ok(None)) => break, // stdout closed, ffmpeg exiting
            Ok(Err(e)) => {
                return Err(AppError::EncoderError {
                    resolution: resolution.to_string(),
                    detail: format!("failed reading ffmpeg progress: {e}"),
                })
            }
            Err(_elapsed) => {
                missed_heartbeats += 1;
                if missed_heartbeats == 1 {
                    tracing::warn!(resolution, "encoder missed heartbeat window, sending SIGTERM");
                    terminate(child);
                    continue;
                }
                tracing::error!(resolution, "encoder unresponsive after SIGTERM, waiting kill grace");
                if tokio::time::timeout(kill_grace, child.wait()).await.is_err() {
                    kill(child);
                }
                return Err(AppError::Stalled(format!(
                    "encoder for {resolution} stopped emitting progress"
                )));
            }
        };

        if let Some((key, value)) = line.split_once('=') {
            if key == "out_time_ms" {
                if let Ok(out_time_ms) = value.trim().parse::<i64>() {
                    let percent = if duration_secs > 0.0 {
                        (((out_time_ms as f64 / 1000.0 / 1000.0) / duration_secs) * 100.0)
                            .clamp(0.0, 100.0) as i32
                    } else {
                        0
                    };
                    let _ = progress_tx
                        .send(EncodeProgress { resolution, percent })
                        .await;
                }
            } else if key == "progress" && value.trim() == "end" {
                let _ = progress_tx
                    .send(EncodeProgress { resolution, percent: 100 })
                    .await;
                break;
            }
        }
    }

    Ok(())
}

#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

#[cfg(unix)]
fn kill(child: &Child) {
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill as nix_kill, Signal};
        use nix::unistd::Pid;
        let _ = nix_kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill(_child: &Child) {}

/// Generate the master playlist referencing each already-encoded
/// resolution's variant playlist, ascending bitrate order per the
/// resolution table.
pub fn build_master_playlist(resolutions: &[&str]) -> String {
    let mut lines = vec!["#EXTM3U".to_string(), "#EXT-X-VERSION:3".to_string()];
    for name in resolutions {
        if let Some(spec) = resolution_spec(name) {
            let bandwidth = (spec.video_bitrate_kbps + spec.audio_bitrate_kbps) * 1000;
            lines.push(format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}",
                bandwidth, spec.width, spec.height
            ));
            lines.push(format!("{}/index.m3u8", name));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Scoped temp directory used while encoding a job: created on
/// construction, removed on drop regardless of how the worker exits the
/// scope (success, error, or cancellation checkpoint).
pub struct JobTempDir {
    path: PathBuf,
}

impl JobTempDir {
    pub async fn create(root: &Path, job_id: &str) -> Result<Self> {
        let path = root.join(format!("transcode-{job_id}"));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| AppError::Internal(format!("failed to create temp dir: {e}")))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JobTempDir {
    fn drop(&mut self) {
        let path = self.path.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to clean up job temp dir");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_table_is_ascending_bitrate() {
        let bitrates: Vec<u32> = RESOLUTION_TABLE.iter().map(|r| r.video_bitrate_kbps).collect();
        let mut sorted = bitrates.clone();
        sorted.sort();
        assert_eq!(bitrates, sorted);
    }

    #[test]
    fn resolution_spec_lookup() {
        let spec = resolution_spec("720p").expect("720p exists");
        assert_eq!(spec.width, 1280);
        assert_eq!(spec.height, 720);
        assert!(resolution_spec("nonexistent").is_none());
    }

    #[test]
    fn master_playlist_lists_variants_in_ascending_order() {
        let playlist = build_master_playlist(&["360p", "480p", "720p", "1080p"]);
        let idx_360 = playlist.find("360p/index.m3u8").unwrap();
        let idx_480 = playlist.find("480p/index.m3u8").unwrap();
        let idx_720 = playlist.find("720p/index.m3u8").unwrap();
        let idx_1080 = playlist.find("1080p/index.m3u8").unwrap();
        assert!(idx_360 < idx_480 && idx_480 < idx_720 && idx_720 < idx_1080);
        assert!(playlist.starts_with("#EXTM3U"));
    }

    #[test]
    fn master_playlist_skips_unknown_resolutions() {
        let playlist = build_master_playlist(&["360p", "bogus"]);
        assert!(playlist.contains("360p/index.m3u8"));
        assert!(!playlist.contains("bogus"));
    }
}
