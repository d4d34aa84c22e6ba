#![forbid(unsafe_code)]

//! Helpers for tests that drive stub executables.

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Writes an executable bash script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, format!("#!/usr/bin/env bash\nset -eu\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }
    path
}

/// A stub that accepts anything and exits successfully.
pub fn write_noop(dir: &Path, name: &str) -> PathBuf {
    write_script(dir, name, "exit 0")
}

/// yt-dlp stand-in. Prints `metadata_json` for `--dump-single-json`, writes a
/// fake merged file for downloads, and appends every argument list to `log`.
/// `metadata_json` must not contain single quotes.
pub fn write_ytdlp_stub(dir: &Path, metadata_json: &str, log: &Path) -> PathBuf {
    let body = r#"args=("$@")
output=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    --output)
      shift
      output="$1"
      ;;
  esac
  shift
done
printf '%s\n' "${args[@]}" >> '__LOG__'
echo '--' >> '__LOG__'

if printf '%s\n' "${args[@]}" | grep -q -- '--dump-single-json'; then
  printf '%s\n' '__JSON__'
  exit 0
fi

if [[ -n "$output" ]]; then
  target="${output//%(ext)s/mkv}"
  mkdir -p "$(dirname "$target")"
  echo "media" > "$target"
fi
exit 0"#
        .replace("__LOG__", &log.display().to_string())
        .replace("__JSON__", metadata_json);
    write_script(dir, "yt-dlp", &body)
}

/// ffmpeg stand-in that copies its `-i` input to the last argument, or fails
/// with status 1 when `succeed` is false. Version probes always pass.
pub fn write_ffmpeg_stub(dir: &Path, succeed: bool) -> PathBuf {
    let body = r#"input=""
prev=""
for arg in "$@"; do
  if [[ "$prev" == "-i" ]]; then
    input="$arg"
  fi
  prev="$arg"
done
if [[ -z "$input" ]]; then
  exit 0
fi
__ACTION__"#
        .replace(
            "__ACTION__",
            if succeed {
                "out=\"${@: -1}\"\ncp \"$input\" \"$out\""
            } else {
                "echo 'Conversion failed!' >&2\nexit 1"
            },
        );
    write_script(dir, "ffmpeg", &body)
}
