use std::path::{Path, PathBuf};

use crate::audio::AudioSettings;
use crate::config::EncoderConfig;

/// Raw s16le in on stdin, Ogg/Opus voice out, overwriting stale files
const DEFAULT_ARGS: &[&str] = &[
    "-f",
    "s16le",
    "-ar",
    "{rate}",
    "-ac",
    "{channels}",
    "-i",
    "pipe:0",
    "-c:a",
    "libopus",
    "-b:a",
    "{bitrate}",
    "-application",
    "voip",
    "-flush_packets",
    "1",
    "-vn",
    "-y",
    "{output}",
];

/// Expand the argument template for one session
pub fn build_args(config: &EncoderConfig, audio: &AudioSettings, output: &Path) -> Vec<String> {
    let template: Vec<String> = match &config.args {
        Some(args) => args.clone(),
        None => DEFAULT_ARGS.iter().map(|s| s.to_string()).collect(),
    };

    let output = output.display().to_string();
    template
        .into_iter()
        .map(|arg| {
            arg.replace("{rate}", &audio.sample_rate.to_string())
                .replace("{channels}", &audio.channels.to_string())
                .replace("{bitrate}", &config.bitrate)
                .replace("{output}", &output)
        })
        .collect()
}

/// Resolve the encoder executable: explicit paths are checked as-is, bare
/// names are searched on PATH.
pub fn locate_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.is_absolute() || candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| path.is_file())
}
