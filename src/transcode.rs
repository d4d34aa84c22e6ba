#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;

use anyhow::bail;
use tracing::{debug, info};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TargetFormat {
    #[default]
    Mp4,
    Mkv,
    Webm,
}

impl TargetFormat {
    pub fn extension(self) -> &'static str {
        match self {
            TargetFormat::Mp4 => "mp4",
            TargetFormat::Mkv => "mkv",
            TargetFormat::Webm => "webm",
        }
    }

    /// ffmpeg muxer name. Passed explicitly because the staging file ends in
    /// `.part`.
    fn muxer(self) -> &'static str {
        match self {
            TargetFormat::Mp4 => "mp4",
            TargetFormat::Mkv => "matroska",
            TargetFormat::Webm => "webm",
        }
    }

    fn codec_args(self) -> &'static [&'static str] {
        match self {
            TargetFormat::Mp4 => &[
                "-c:v", "libx264", "-preset", "medium", "-crf", "23", "-pix_fmt", "yuv420p",
                "-c:a", "aac", "-b:a", "192k", "-movflags", "+faststart",
            ],
            TargetFormat::Mkv => &["-c", "copy"],
            TargetFormat::Webm => &[
                "-c:v", "libvpx-vp9", "-crf", "32", "-b:v", "0", "-c:a", "libopus", "-b:a", "128k",
            ],
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for TargetFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp4" => Ok(TargetFormat::Mp4),
            "mkv" | "matroska" => Ok(TargetFormat::Mkv),
            "webm" => Ok(TargetFormat::Webm),
            other => bail!("unsupported output format {other:?} (expected mp4, mkv or webm)"),
        }
    }
}

pub struct Transcoder {
    ffmpeg: PathBuf,
    format: TargetFormat,
    overwrite: bool,
    verbose: bool,
}

impl Transcoder {
    pub fn new(ffmpeg: PathBuf, format: TargetFormat, overwrite: bool, verbose: bool) -> Self {
        Self {
            ffmpeg,
            format,
            overwrite,
            verbose,
        }
    }

    pub fn output_path(&self, output_dir: &Path, stem: &str) -> PathBuf {
        output_dir.join(format!("{stem}.{}", self.format.extension()))
    }

    /// Converts `raw` into `<output_dir>/<stem>.<ext>`.
    ///
    /// ffmpeg writes to a `.part` sibling that is renamed into place only
    /// after a successful, non-empty encode. `raw` is never touched.
    pub fn transcode(
        &self,
        raw: &Path,
        output_dir: &Path,
        stem: &str,
    ) -> Result<PathBuf, PipelineError> {
        fs::create_dir_all(output_dir)
            .map_err(|err| PipelineError::filesystem("creating", output_dir, err))?;
        let output = self.output_path(output_dir, stem);
        if output.exists() && !self.overwrite {
            return Err(PipelineError::filesystem(
                "refusing to overwrite",
                &output,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "file exists (pass --overwrite to replace it)",
                ),
            ));
        }

        let mut staging = output.as_os_str().to_owned();
        staging.push(".part");
        let staging = PathBuf::from(staging);

        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-hide_banner")
            .arg("-nostdin")
            .arg("-loglevel")
            .arg(if self.verbose { "info" } else { "error" })
            .arg("-y")
            .arg("-i")
            .arg(raw)
            .args(self.format.codec_args())
            .arg("-f")
            .arg(self.format.muxer())
            .arg(&staging)
            .stdin(Stdio::null());
        debug!(?command, "transcoding");
        info!(raw = %raw.display(), output = %output.display(), format = %self.format, "transcoding");

        let failed = |reason: String| {
            let _ = fs::remove_file(&staging);
            PipelineError::TranscodeFailed {
                reason,
                raw: raw.to_path_buf(),
            }
        };

        let status = command
            .status()
            .map_err(|err| failed(format!("could not run ffmpeg: {err}")))?;
        if !status.success() {
            return Err(failed(format!("ffmpeg exited with {status}")));
        }
        match fs::metadata(&staging) {
            Ok(meta) if meta.len() > 0 => {}
            _ => return Err(failed("ffmpeg produced no output".to_string())),
        }

        fs::rename(&staging, &output)
            .map_err(|err| PipelineError::filesystem("moving output into", &output, err))?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_formats() {
        assert_eq!("MP4".parse::<TargetFormat>().unwrap(), TargetFormat::Mp4);
        assert_eq!("matroska".parse::<TargetFormat>().unwrap(), TargetFormat::Mkv);
        assert_eq!(" webm ".parse::<TargetFormat>().unwrap(), TargetFormat::Webm);
        assert!("avi".parse::<TargetFormat>().is_err());
    }

    #[test]
    fn output_path_uses_format_extension() {
        let transcoder = Transcoder::new(PathBuf::from("ffmpeg"), TargetFormat::Webm, false, false);
        assert_eq!(
            transcoder.output_path(Path::new("/out"), "My Video Part 1 2"),
            PathBuf::from("/out/My Video Part 1 2.webm")
        );
    }

    #[test]
    fn refuses_to_clobber_existing_output() {
        let temp = tempdir().unwrap();
        let raw = temp.path().join("abc.raw.mkv");
        fs::write(&raw, "media").unwrap();
        fs::write(temp.path().join("Title.mp4"), "keep me").unwrap();

        let transcoder = Transcoder::new(PathBuf::from("/no/ffmpeg"), TargetFormat::Mp4, false, false);
        let err = transcoder.transcode(&raw, temp.path(), "Title").unwrap_err();
        assert!(matches!(err, PipelineError::Filesystem { .. }));
        assert_eq!(fs::read_to_string(temp.path().join("Title.mp4")).unwrap(), "keep me");
    }

    #[cfg(unix)]
    mod with_stub {
        use super::*;
        use crate::test_support::{write_ffmpeg_stub, write_script};

        #[test]
        fn successful_encode_lands_at_final_path() {
            let temp = tempdir().unwrap();
            let raw = temp.path().join("abc.raw.mkv");
            fs::write(&raw, "media").unwrap();
            let ffmpeg = write_ffmpeg_stub(&temp.path().join("bin"), true);
            let out_dir = temp.path().join("out");

            let transcoder = Transcoder::new(ffmpeg, TargetFormat::Mp4, false, false);
            let output = transcoder.transcode(&raw, &out_dir, "Title").unwrap();

            assert_eq!(output, out_dir.join("Title.mp4"));
            assert_eq!(fs::read_to_string(&output).unwrap(), "media");
            let entries: Vec<_> = fs::read_dir(&out_dir).unwrap().flatten().collect();
            assert_eq!(entries.len(), 1);
            assert!(raw.exists());
        }

        #[test]
        fn failed_encode_keeps_raw_and_drops_partial() {
            let temp = tempdir().unwrap();
            let raw = temp.path().join("abc.raw.mkv");
            fs::write(&raw, "media").unwrap();
            let ffmpeg = write_ffmpeg_stub(&temp.path().join("bin"), false);
            let out_dir = temp.path().join("out");

            let transcoder = Transcoder::new(ffmpeg, TargetFormat::Mp4, false, false);
            let err = transcoder.transcode(&raw, &out_dir, "Title").unwrap_err();

            match err {
                PipelineError::TranscodeFailed { raw: kept, .. } => assert_eq!(kept, raw),
                other => panic!("unexpected error: {other}"),
            }
            assert!(raw.exists());
            assert_eq!(fs::read_dir(&out_dir).unwrap().count(), 0);
        }

        #[test]
        fn empty_output_is_a_failure() {
            let temp = tempdir().unwrap();
            let raw = temp.path().join("abc.raw.mkv");
            fs::write(&raw, "media").unwrap();
            let ffmpeg = write_script(&temp.path().join("bin"), "ffmpeg", "touch \"${@: -1}\"");
            let out_dir = temp.path().join("out");

            let transcoder = Transcoder::new(ffmpeg, TargetFormat::Mkv, false, false);
            let err = transcoder.transcode(&raw, &out_dir, "Title").unwrap_err();
            assert!(err.to_string().contains("no output"));
            assert!(!out_dir.join("Title.mkv.part").exists());
        }

        #[test]
        fn overwrite_replaces_existing_output() {
            let temp = tempdir().unwrap();
            let raw = temp.path().join("abc.raw.mkv");
            fs::write(&raw, "fresh").unwrap();
            fs::write(temp.path().join("Title.mp4"), "stale").unwrap();
            let ffmpeg = write_ffmpeg_stub(&temp.path().join("bin"), true);

            let transcoder = Transcoder::new(ffmpeg, TargetFormat::Mp4, true, false);
            let output = transcoder.transcode(&raw, temp.path(), "Title").unwrap();
            assert_eq!(fs::read_to_string(output).unwrap(), "fresh");
        }
    }
}
