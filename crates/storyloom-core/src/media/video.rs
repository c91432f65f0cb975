//! Video composition from per-page assets
//!
//! Builds one looped, scaled segment per image, concatenates the segments,
//! and optionally muxes a single audio track with `-shortest` semantics.
//! Everything runs through an ffmpeg subprocess; the output is a local
//! file the caller uploads before inserting the asset row.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::{Error, Result};

/// Output frame size; portrait devices letterbox on their own
const FRAME_WIDTH: u32 = 1280;
const FRAME_HEIGHT: u32 = 720;

/// Seconds each image is shown when the payload carries no durations
const DEFAULT_PAGE_DURATION: f64 = 3.0;

/// Video-job payload shape
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInput {
    pub image_uris: Vec<String>,
    #[serde(default)]
    pub audio_uri: Option<String>,
    #[serde(default)]
    pub per_page_durations: Option<Vec<f64>>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub fps: Option<u32>,
}

pub struct VideoComposer {
    default_fps: u32,
}

impl VideoComposer {
    pub fn new(default_fps: u32) -> Self {
        Self { default_fps }
    }

    /// Compose the final video inside `workdir` and return its path
    pub async fn compose(&self, input: &VideoInput, workdir: &Path) -> Result<PathBuf> {
        if input.image_uris.is_empty() {
            return Err(Error::media("video composition needs at least one image"));
        }

        let fps = input.fps.unwrap_or(self.default_fps);
        let format = input.format.as_deref().unwrap_or("mp4");

        let mut segments = Vec::with_capacity(input.image_uris.len());
        for (idx, image) in input.image_uris.iter().enumerate() {
            let duration = page_duration(input.per_page_durations.as_deref(), idx);
            let segment = workdir.join(format!("segment_{:03}.{}", idx, format));

            run_ffmpeg(&segment_args(image, duration, fps, &segment)).await?;
            segments.push(segment);
        }

        let list_path = workdir.join("segments.txt");
        tokio::fs::write(&list_path, concat_list(&segments)).await?;

        let silent = workdir.join(format!("silent.{}", format));
        run_ffmpeg(&concat_args(&list_path, &silent)).await?;

        let Some(audio) = &input.audio_uri else {
            return Ok(silent);
        };

        let output = workdir.join(format!("story.{}", format));
        run_ffmpeg(&mux_args(&silent, audio, &output)).await?;

        Ok(output)
    }
}

/// Duration for one page, falling back to the default
fn page_duration(durations: Option<&[f64]>, idx: usize) -> f64 {
    durations
        .and_then(|d| d.get(idx).copied())
        .filter(|d| *d > 0.0)
        .unwrap_or(DEFAULT_PAGE_DURATION)
}

fn segment_args(image: &str, duration: f64, fps: u32, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-loop".to_string(),
        "1".to_string(),
        "-t".to_string(),
        format!("{}", duration),
        "-i".to_string(),
        image.to_string(),
        "-vf".to_string(),
        format!("scale={}:{}", FRAME_WIDTH, FRAME_HEIGHT),
        "-r".to_string(),
        fps.to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

fn concat_list(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|s| format!("file '{}'\n", s.display()))
        .collect()
}

fn concat_args(list_path: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        list_path.to_string_lossy().to_string(),
        "-c".to_string(),
        "copy".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

fn mux_args(video: &Path, audio: &str, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        video.to_string_lossy().to_string(),
        "-i".to_string(),
        audio.to_string(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-shortest".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

async fn run_ffmpeg(args: &[String]) -> Result<()> {
    tracing::debug!(args = ?args, "Running ffmpeg");

    let output = Command::new("ffmpeg")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::media(format!("could not spawn ffmpeg: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
        return Err(Error::media(format!(
            "ffmpeg exited with {}: {}",
            output.status, tail
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_duration_defaults_to_three_seconds() {
        assert_eq!(page_duration(None, 0), 3.0);
        assert_eq!(page_duration(Some(&[5.0, 2.5]), 1), 2.5);
        assert_eq!(page_duration(Some(&[5.0]), 3), 3.0);
        assert_eq!(page_duration(Some(&[0.0]), 0), 3.0);
    }

    #[test]
    fn test_segment_args_scale_and_loop() {
        let args = segment_args("page1.png", 3.0, 24, Path::new("/tmp/segment_000.mp4"));

        assert!(args.contains(&"-loop".to_string()));
        assert!(args.contains(&"scale=1280:720".to_string()));
        assert!(args.contains(&"24".to_string()));
        assert_eq!(args[args.len() - 1], "/tmp/segment_000.mp4");
    }

    #[test]
    fn test_mux_uses_shortest() {
        let args = mux_args(Path::new("silent.mp4"), "narration.mp3", Path::new("out.mp4"));
        assert!(args.contains(&"-shortest".to_string()));
    }

    #[test]
    fn test_concat_list_format() {
        let list = concat_list(&[PathBuf::from("a.mp4"), PathBuf::from("b.mp4")]);
        assert_eq!(list, "file 'a.mp4'\nfile 'b.mp4'\n");
    }

    #[test]
    fn test_video_input_payload_shape() {
        let input: VideoInput = serde_json::from_value(serde_json::json!({
            "imageUris": ["a.png", "b.png"],
            "audioUri": "narration.mp3",
            "perPageDurations": [4.0, 2.0],
        }))
        .unwrap();

        assert_eq!(input.image_uris.len(), 2);
        assert_eq!(input.audio_uri.as_deref(), Some("narration.mp3"));
        assert!(input.fps.is_none());
    }
}
