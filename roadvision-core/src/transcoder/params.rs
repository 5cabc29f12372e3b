//! Parameters that control how the transcoder is invoked.  Every stream is transcoded with the same
//! parameters; only the source and the output playlist differ between invocations.

use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Placeholder in a custom argument template that is replaced with the stream's source
pub const SOURCE_PLACEHOLDER: &str = "{source}";

/// Placeholder in a custom argument template that is replaced with the output playlist path
pub const PLAYLIST_PLACEHOLDER: &str = "{playlist}";

/// Name of the playlist written into each stream's output directory
pub const PLAYLIST_FILE_NAME: &str = "playlist.m3u8";

#[derive(Error, Debug)]
#[error("'{0}' is not a known h264 preset")]
pub struct UnknownPresetError(pub String);

/// H264 presets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum H264Preset {
    UltraFast,
    SuperFast,
    VeryFast,
    Faster,
    Fast,
    Medium,
    Slow,
    Slower,
    VerySlow,
}

impl H264Preset {
    fn as_str(&self) -> &'static str {
        match self {
            H264Preset::UltraFast => "ultrafast",
            H264Preset::SuperFast => "superfast",
            H264Preset::VeryFast => "veryfast",
            H264Preset::Faster => "faster",
            H264Preset::Fast => "fast",
            H264Preset::Medium => "medium",
            H264Preset::Slow => "slow",
            H264Preset::Slower => "slower",
            H264Preset::VerySlow => "veryslow",
        }
    }
}

impl FromStr for H264Preset {
    type Err = UnknownPresetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "ultrafast" => Ok(H264Preset::UltraFast),
            "superfast" => Ok(H264Preset::SuperFast),
            "veryfast" => Ok(H264Preset::VeryFast),
            "faster" => Ok(H264Preset::Faster),
            "fast" => Ok(H264Preset::Fast),
            "medium" => Ok(H264Preset::Medium),
            "slow" => Ok(H264Preset::Slow),
            "slower" => Ok(H264Preset::Slower),
            "veryslow" => Ok(H264Preset::VerySlow),
            _ => Err(UnknownPresetError(value.to_string())),
        }
    }
}

/// Video transcode instructions
#[derive(Clone, Debug)]
pub enum VideoTranscodeParams {
    Copy,

    /// Encode with libx264 into yuv420p, tuned for low latency
    H264 { preset: H264Preset },
}

/// Audio transcode instructions
#[derive(Clone, Debug)]
pub enum AudioTranscodeParams {
    Copy,
    Aac,
}

/// How the HLS playlist should be segmented
#[derive(Clone, Debug)]
pub struct HlsParams {
    /// How long (in seconds) should each segment be
    pub segment_length: u16,

    /// The maximum number of segments that should be in the playlist, where 0 keeps all of them.
    /// If none is specified then ffmpeg's default will be used
    pub max_entries: Option<u16>,

    /// Whether segments that fall out of the playlist should be deleted from disk
    pub delete_old_segments: bool,
}

/// Fixed parameters every transcoder invocation is built from
#[derive(Clone, Debug)]
pub struct TranscodeParams {
    /// Request that the rtsp session is interleaved over tcp instead of using udp
    pub rtsp_over_tcp: bool,
    pub video_transcode: VideoTranscodeParams,
    pub audio_transcode: AudioTranscodeParams,
    pub hls: HlsParams,
}

impl Default for TranscodeParams {
    fn default() -> Self {
        TranscodeParams {
            rtsp_over_tcp: true,
            video_transcode: VideoTranscodeParams::H264 {
                preset: H264Preset::VeryFast,
            },
            audio_transcode: AudioTranscodeParams::Aac,
            hls: HlsParams {
                segment_length: 2,
                max_entries: Some(3),
                delete_old_segments: true,
            },
        }
    }
}

impl TranscodeParams {
    /// Builds the ffmpeg arguments that read from `source` and write an HLS playlist to `playlist`
    pub fn to_arguments(&self, source: &str, playlist: &Path) -> Vec<String> {
        let mut args = vec!["-y".to_string()]; // always overwrite
        if self.rtsp_over_tcp {
            args.push("-rtsp_transport".to_string());
            args.push("tcp".to_string());
        }

        args.push("-i".to_string());
        args.push(source.to_string());

        args.push("-c:v".to_string());
        match &self.video_transcode {
            VideoTranscodeParams::Copy => args.push("copy".to_string()),
            VideoTranscodeParams::H264 { preset } => {
                args.push("libx264".to_string());
                args.push("-pix_fmt".to_string());
                args.push("yuv420p".to_string());
                args.push("-preset".to_string());
                args.push(preset.as_str().to_string());
                args.push("-tune".to_string());
                args.push("zerolatency".to_string());
            }
        }

        args.push("-c:a".to_string());
        match &self.audio_transcode {
            AudioTranscodeParams::Copy => args.push("copy".to_string()),
            AudioTranscodeParams::Aac => args.push("aac".to_string()),
        }

        args.push("-f".to_string());
        args.push("hls".to_string());

        args.push("-hls_time".to_string());
        args.push(self.hls.segment_length.to_string());

        if let Some(entries) = self.hls.max_entries {
            args.push("-hls_list_size".to_string());
            args.push(entries.to_string());
        }

        args.push("-hls_flags".to_string());
        if self.hls.delete_old_segments {
            args.push("delete_segments+omit_endlist".to_string());
        } else {
            args.push("omit_endlist".to_string());
        }

        args.push(playlist.display().to_string());

        args
    }
}

/// The argument list handed to the transcoder executable
#[derive(Clone, Debug)]
pub enum TranscoderArguments {
    /// Arguments are generated from typed ffmpeg parameters
    Params(TranscodeParams),

    /// Arguments are taken as-is, with the `{source}` and `{playlist}` placeholders substituted
    Template(Vec<String>),
}

impl TranscoderArguments {
    pub fn build(&self, source: &str, playlist: &Path) -> Vec<String> {
        match self {
            TranscoderArguments::Params(params) => params.to_arguments(source, playlist),
            TranscoderArguments::Template(template) => {
                let playlist = playlist.display().to_string();
                template
                    .iter()
                    .map(|arg| {
                        arg.replace(SOURCE_PLACEHOLDER, source)
                            .replace(PLAYLIST_PLACEHOLDER, &playlist)
                    })
                    .collect()
            }
        }
    }
}

impl Default for TranscoderArguments {
    fn default() -> Self {
        TranscoderArguments::Params(TranscodeParams::default())
    }
}
