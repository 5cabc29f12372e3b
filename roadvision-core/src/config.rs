//! Parsing of the roadvision configuration file.
//!
//! The file consists of an optional `settings` block with one `name value` pair per line, and any
//! number of `stream` blocks that declare streams to track as soon as the application starts.
//!
//! ```text
//! settings {
//!     transcoder_path /usr/bin/ffmpeg
//!     http_api_port 8000
//! }
//!
//! stream "Main St" {
//!     source rtsp://10.0.0.5/live
//! }
//! ```

use crate::inference::InferenceSettings;
use crate::manager::StreamManagerSettings;
use crate::registry::DEFAULT_ALERT_CAPACITY;
use crate::transcoder::params::{
    AudioTranscodeParams, H264Preset, TranscodeParams, TranscoderArguments, VideoTranscodeParams,
    PLAYLIST_PLACEHOLDER,
};
use crate::transcoder::TranscoderSettings;
use pest::iterators::Pair;
use pest::Parser;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub struct RoadvisionConfig {
    pub settings: HashMap<String, Option<String>>,
    pub streams: Vec<StreamDefinition>,
}

/// A stream declared in the configuration file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamDefinition {
    pub name: String,
    pub source: String,
}

#[derive(Error, Debug)]
pub enum ConfigParseError {
    #[error("The config provided could not be parsed")]
    InvalidConfig(#[from] pest::error::Error<Rule>),

    #[error("Found unexpected rule '{rule:?}' in the {section} section")]
    UnexpectedRule { rule: Rule, section: String },

    #[error("Stream '{name}' has no source")]
    MissingSource { name: String },

    #[error("Stream '{name}' has an unknown setting '{setting}'")]
    UnknownStreamSetting { name: String, setting: String },
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("The value '{value}' is not valid for the '{name}' setting")]
    InvalidValue { name: String, value: String },
}

#[derive(Parser)]
#[grammar = "config.pest"]
struct RawConfigParser;

pub fn parse(content: &str) -> Result<RoadvisionConfig, ConfigParseError> {
    let mut config = RoadvisionConfig {
        settings: HashMap::new(),
        streams: Vec::new(),
    };

    let pairs = RawConfigParser::parse(Rule::content, content)?;
    for pair in pairs {
        let rule = pair.as_rule();
        match &rule {
            Rule::setting_block => {
                for (name, value) in read_settings(pair, "setting_block")? {
                    config.settings.insert(name, value);
                }
            }

            Rule::stream_block => config.streams.push(read_stream_block(pair)?),
            _ => (),
        }
    }

    Ok(config)
}

/// Reads the `name value` pairs of a block.  A name without a value is a flag.
fn read_settings(
    pair: Pair<Rule>,
    section: &str,
) -> Result<Vec<(String, Option<String>)>, ConfigParseError> {
    let mut settings = Vec::new();
    let mut current_setting_name = None;
    for pair in pair.into_inner() {
        match pair.as_rule() {
            Rule::setting_name => {
                if let Some(name) = current_setting_name.take() {
                    // previous setting had no value, was a flag
                    settings.push((name, None));
                }

                current_setting_name = Some(pair.as_str().to_string());
            }

            Rule::setting_value => {
                if let Some(name) = current_setting_name.take() {
                    let value = read_value(pair);
                    if value.trim().is_empty() {
                        settings.push((name, None));
                    } else {
                        settings.push((name, Some(value)));
                    }
                }
            }

            Rule::stream_name => (),

            x => {
                return Err(ConfigParseError::UnexpectedRule {
                    rule: x,
                    section: section.to_string(),
                })
            }
        }
    }

    if let Some(name) = current_setting_name {
        settings.push((name, None));
    }

    Ok(settings)
}

fn read_stream_block(pair: Pair<Rule>) -> Result<StreamDefinition, ConfigParseError> {
    let name = pair
        .clone()
        .into_inner()
        .find(|inner| inner.as_rule() == Rule::stream_name)
        .map(read_value)
        .unwrap_or_default();

    let mut source = None;
    for (setting, value) in read_settings(pair, "stream_block")? {
        match setting.as_str() {
            "source" => source = value,
            _ => {
                return Err(ConfigParseError::UnknownStreamSetting {
                    name,
                    setting,
                })
            }
        }
    }

    match source {
        Some(source) => Ok(StreamDefinition { name, source }),
        None => Err(ConfigParseError::MissingSource { name }),
    }
}

/// Returns the unquoted text of a value, which may or may not have been surrounded by quotes
fn read_value(pair: Pair<Rule>) -> String {
    let raw_value = pair.as_str().to_string();
    for inner in pair.into_inner() {
        if inner.as_rule() == Rule::quoted_string_value {
            return inner.as_str().to_string();
        }
    }

    raw_value
}

/// Settings the application needs beyond the stream manager's own
pub struct AppSettings {
    pub manager: StreamManagerSettings,

    /// Executable used to grab frames for analysis
    pub capture_path: String,

    /// How long a single frame grab may take
    pub capture_timeout: Duration,

    /// External detection model command, if one is configured
    pub detector_path: Option<String>,

    /// Where the HTTP api should listen.  The api is disabled when not set.
    pub http_api_address: Option<SocketAddr>,
}

impl AppSettings {
    /// Builds the typed application settings out of the config's settings block, falling back to
    /// defaults for anything that is not specified.
    pub fn from_config(config: &RoadvisionConfig, log_root: &Path) -> Result<Self, SettingsError> {
        let settings = &config.settings;
        let transcoder_path = text(settings, "transcoder_path").unwrap_or("ffmpeg").to_string();

        let arguments = match settings.get("transcoder_arguments") {
            Some(_) => TranscoderArguments::Template(argument_template(settings)?),
            None => TranscoderArguments::Params(transcode_params(settings)?),
        };

        let transcoder = TranscoderSettings {
            executable: transcoder_path.clone(),
            arguments,
            output_root: PathBuf::from(text(settings, "output_root").unwrap_or("hls_output")),
            log_root: Some(log_root.to_path_buf()),
            playback_base_url: text(settings, "playback_base_url")
                .unwrap_or("http://localhost:8000/hls")
                .to_string(),
            stop_grace_period: Duration::from_millis(parsed(settings, "stop_grace_period_ms", 5000)?),
        };

        let inference = InferenceSettings {
            sample_interval: Duration::from_millis(parsed(settings, "sample_interval_ms", 1000)?),
            retry_backoff: Duration::from_millis(parsed(settings, "capture_retry_backoff_ms", 10_000)?),
        };

        let http_api_address = match text(settings, "http_api_port") {
            Some(_) => {
                let port = parsed::<u16>(settings, "http_api_port", 0)?;
                let ip = parsed(settings, "http_api_bind", IpAddr::V4(Ipv4Addr::LOCALHOST))?;
                Some(SocketAddr::new(ip, port))
            }

            None => None,
        };

        Ok(AppSettings {
            manager: StreamManagerSettings {
                transcoder,
                inference,
                max_alerts: parsed(settings, "max_alerts", DEFAULT_ALERT_CAPACITY)?,
            },
            capture_path: text(settings, "capture_path")
                .map(|path| path.to_string())
                .unwrap_or(transcoder_path),
            capture_timeout: Duration::from_millis(parsed(settings, "capture_timeout_ms", 10_000)?),
            detector_path: text(settings, "detector_path").map(|path| path.to_string()),
            http_api_address,
        })
    }
}

/// Builds the typed ffmpeg parameters out of the individual transcoding settings
fn transcode_params(
    settings: &HashMap<String, Option<String>>,
) -> Result<TranscodeParams, SettingsError> {
    let mut params = TranscodeParams::default();
    params.rtsp_over_tcp = one_of(
        settings,
        "rtsp_transport",
        &[("tcp", true), ("udp", false)],
        true,
    )?;

    let h264 = VideoTranscodeParams::H264 {
        preset: parsed(settings, "h264_preset", H264Preset::VeryFast)?,
    };

    params.video_transcode = one_of(
        settings,
        "video_codec",
        &[("h264", h264.clone()), ("copy", VideoTranscodeParams::Copy)],
        h264,
    )?;

    params.audio_transcode = one_of(
        settings,
        "audio_codec",
        &[("aac", AudioTranscodeParams::Aac), ("copy", AudioTranscodeParams::Copy)],
        AudioTranscodeParams::Aac,
    )?;

    params.hls.segment_length = parsed(settings, "hls_segment_duration", 2)?;

    // `default` leaves the playlist size up to ffmpeg, while 0 keeps every segment
    params.hls.max_entries = match text(settings, "hls_segment_count") {
        Some(value) if value.eq_ignore_ascii_case("default") => None,
        _ => Some(parsed(settings, "hls_segment_count", 3)?),
    };

    params.hls.delete_old_segments = parsed(settings, "hls_delete_segments", true)?;

    Ok(params)
}

/// Splits the `transcoder_arguments` setting on whitespace into the argument template
fn argument_template(
    settings: &HashMap<String, Option<String>>,
) -> Result<Vec<String>, SettingsError> {
    let template = text(settings, "transcoder_arguments")
        .map(|value| value.split_whitespace().map(|arg| arg.to_string()).collect::<Vec<_>>())
        .unwrap_or_default();

    if template.is_empty() {
        return Err(SettingsError::InvalidValue {
            name: "transcoder_arguments".to_string(),
            value: "".to_string(),
        });
    }

    if !template.iter().any(|arg| arg.contains(PLAYLIST_PLACEHOLDER)) {
        warn!(
            "transcoder_arguments does not contain {}, no playlist will be written where it is served from",
            PLAYLIST_PLACEHOLDER
        );
    }

    Ok(template)
}

fn text<'a>(settings: &'a HashMap<String, Option<String>>, name: &str) -> Option<&'a str> {
    match settings.get(name) {
        Some(Some(value)) => Some(value.as_str()),
        _ => None,
    }
}

/// Parses the named setting, using the default if the setting isn't present.  A setting that is
/// present as a flag, without a value, is invalid.
fn parsed<T: FromStr>(
    settings: &HashMap<String, Option<String>>,
    name: &str,
    default: T,
) -> Result<T, SettingsError> {
    match settings.get(name) {
        None => Ok(default),
        Some(None) => Err(SettingsError::InvalidValue {
            name: name.to_string(),
            value: "".to_string(),
        }),

        Some(Some(value)) => value.parse().map_err(|_| SettingsError::InvalidValue {
            name: name.to_string(),
            value: value.clone(),
        }),
    }
}

/// Matches the named setting, case insensitively, against a fixed set of allowed values
fn one_of<T: Clone>(
    settings: &HashMap<String, Option<String>>,
    name: &str,
    choices: &[(&str, T)],
    default: T,
) -> Result<T, SettingsError> {
    let value = match settings.get(name) {
        None => return Ok(default),
        Some(None) => "",
        Some(Some(value)) => value.as_str(),
    };

    choices
        .iter()
        .find(|(choice, _)| choice.eq_ignore_ascii_case(value))
        .map(|(_, result)| result.clone())
        .ok_or_else(|| SettingsError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_parse_settings() {
        let content = "
settings {
    first a
    second \"C:\\program files\\ffmpeg\\bin\\ffmpeg.exe\"
    flag

}
";

        let config = parse(content).unwrap();
        assert_eq!(config.settings.len(), 3, "Unexpected number of settings");
        assert_eq!(config.settings.get("first"), Some(&Some("a".to_string())), "Unexpected first value");
        assert_eq!(
            config.settings.get("second"),
            Some(&Some("C:\\program files\\ffmpeg\\bin\\ffmpeg.exe".to_string())),
            "Unexpected second value"
        );
        assert_eq!(config.settings.get("flag"), Some(&None), "Unexpected flag value");
    }

    #[test]
    fn can_read_stream_blocks() {
        let content = "
stream \"Main St\" {
    source rtsp://10.0.0.5/live
}

stream bridge {
    source \"https://example.com/video.m3u8\"
}
";

        let config = parse(content).unwrap();
        assert_eq!(
            config.streams,
            vec![
                StreamDefinition {
                    name: "Main St".to_string(),
                    source: "rtsp://10.0.0.5/live".to_string(),
                },
                StreamDefinition {
                    name: "bridge".to_string(),
                    source: "https://example.com/video.m3u8".to_string(),
                },
            ]
        );
    }

    #[test]
    fn duplicate_stream_names_are_allowed() {
        let content = "
stream cam {
    source rtsp://a
}

stream cam {
    source rtsp://b
}
";

        let config = parse(content).unwrap();
        assert_eq!(config.streams.len(), 2, "Unexpected number of streams");
    }

    #[test]
    fn stream_without_source_returns_error() {
        let content = "
stream cam {
    other value
}
";

        match parse(content) {
            Err(ConfigParseError::UnknownStreamSetting { name, setting }) => {
                assert_eq!(name, "cam");
                assert_eq!(setting, "other");
            }
            Err(e) => panic!("Expected unknown setting error, instead got: {:?}", e),
            Ok(_) => panic!("Received successful parse, but an error was expected"),
        }

        let content = "
stream cam {
    source
}
";

        match parse(content) {
            Err(ConfigParseError::MissingSource { name }) => assert_eq!(name, "cam"),
            Err(e) => panic!("Expected missing source error, instead got: {:?}", e),
            Ok(_) => panic!("Received successful parse, but an error was expected"),
        }
    }

    #[test]
    fn full_config_can_be_parsed() {
        let content = "
# comment
settings {
    transcoder_path /usr/bin/ffmpeg # another comment
    http_api_port 8000
    flag

}

stream \"Main St\" { #stream comment
    source rtsp://10.0.0.5/live #source comment
}
";
        let config = parse(content).unwrap();
        assert_eq!(
            config.settings.get("transcoder_path"),
            Some(&Some("/usr/bin/ffmpeg".to_string()))
        );
        assert_eq!(config.streams.len(), 1);
    }

    #[test]
    fn invalid_config_returns_error() {
        match parse("settings {\n  first a\n") {
            Err(ConfigParseError::InvalidConfig(_)) => (),
            Err(e) => panic!("Expected invalid config error, instead got: {:?}", e),
            Ok(_) => panic!("Received successful parse, but an error was expected"),
        }
    }

    #[test]
    fn defaults_used_when_settings_absent() {
        let config = parse("").unwrap();
        let settings = AppSettings::from_config(&config, Path::new("logs")).unwrap();

        assert_eq!(settings.manager.transcoder.executable, "ffmpeg");
        assert_eq!(settings.manager.transcoder.output_root, PathBuf::from("hls_output"));
        assert_eq!(settings.manager.transcoder.stop_grace_period, Duration::from_secs(5));
        assert_eq!(settings.manager.inference.retry_backoff, Duration::from_secs(10));
        assert_eq!(settings.manager.max_alerts, DEFAULT_ALERT_CAPACITY);
        assert_eq!(settings.capture_path, "ffmpeg");
        assert!(settings.detector_path.is_none());
        assert!(settings.http_api_address.is_none(), "Http api should be disabled");
    }

    #[test]
    fn settings_override_defaults() {
        let content = "
settings {
    transcoder_path /opt/ffmpeg
    output_root /var/hls
    stop_grace_period_ms 250
    hls_segment_duration 4
    h264_preset ultrafast
    max_alerts 10
    http_api_port 9000
    http_api_bind 0.0.0.0
}
";
        let config = parse(content).unwrap();
        let settings = AppSettings::from_config(&config, Path::new("logs")).unwrap();

        assert_eq!(settings.manager.transcoder.executable, "/opt/ffmpeg");
        assert_eq!(settings.capture_path, "/opt/ffmpeg", "Capture should default to transcoder");
        assert_eq!(settings.manager.transcoder.output_root, PathBuf::from("/var/hls"));
        assert_eq!(settings.manager.transcoder.stop_grace_period, Duration::from_millis(250));
        assert_eq!(settings.manager.max_alerts, 10);
        assert_eq!(
            settings.http_api_address,
            Some("0.0.0.0:9000".parse().unwrap())
        );

        let args = settings
            .manager
            .transcoder
            .arguments
            .build("rtsp://camA", Path::new("out.m3u8"));
        assert!(args.contains(&"ultrafast".to_string()), "Preset not applied");
        assert!(args.contains(&"4".to_string()), "Segment duration not applied");
    }

    #[test]
    fn invalid_number_returns_error() {
        let config = parse("settings {\n    max_alerts lots\n}\n").unwrap();

        match AppSettings::from_config(&config, Path::new("logs")) {
            Err(SettingsError::InvalidValue { name, value }) => {
                assert_eq!(name, "max_alerts");
                assert_eq!(value, "lots");
            }
            Ok(_) => panic!("Expected settings to be rejected"),
        }
    }

    #[test]
    fn transcoding_settings_select_codecs_and_transport() {
        let content = "
settings {
    video_codec copy
    audio_codec COPY
    rtsp_transport udp
    hls_segment_count default
    hls_delete_segments false
}
";
        let config = parse(content).unwrap();
        let settings = AppSettings::from_config(&config, Path::new("logs")).unwrap();

        let args = settings
            .manager
            .transcoder
            .arguments
            .build("rtsp://camA", Path::new("out.m3u8"));
        let position = |name: &str| args.iter().position(|arg| arg == name).unwrap();

        assert_eq!(args[position("-c:v") + 1], "copy", "Video should be copied");
        assert_eq!(args[position("-c:a") + 1], "copy", "Audio should be copied");
        assert_eq!(args[position("-hls_flags") + 1], "omit_endlist", "Segments still deleted");
        assert!(!args.contains(&"-rtsp_transport".to_string()), "Tcp transport still requested");
        assert!(!args.contains(&"-hls_list_size".to_string()), "List size still passed");
        assert!(!args.contains(&"libx264".to_string()), "Still encoding video");
    }

    #[test]
    fn zero_segment_count_is_passed_to_ffmpeg() {
        let config = parse("settings {\n    hls_segment_count 0\n}\n").unwrap();
        let settings = AppSettings::from_config(&config, Path::new("logs")).unwrap();

        let args = settings
            .manager
            .transcoder
            .arguments
            .build("rtsp://camA", Path::new("out.m3u8"));
        let position = args.iter().position(|arg| arg == "-hls_list_size").unwrap();
        assert_eq!(args[position + 1], "0");
    }

    #[test]
    fn argument_template_replaces_typed_parameters() {
        let content = "
settings {
    transcoder_arguments \"-i {source} -c copy -f hls {playlist}\"
    video_codec h264
}
";
        let config = parse(content).unwrap();
        let settings = AppSettings::from_config(&config, Path::new("logs")).unwrap();

        let args = settings
            .manager
            .transcoder
            .arguments
            .build("rtsp://camA", Path::new("out/1/playlist.m3u8"));
        assert_eq!(
            args,
            vec!["-i", "rtsp://camA", "-c", "copy", "-f", "hls", "out/1/playlist.m3u8"]
        );
    }

    #[test]
    fn unknown_codec_returns_error() {
        let config = parse("settings {\n    video_codec vp9\n}\n").unwrap();

        match AppSettings::from_config(&config, Path::new("logs")) {
            Err(SettingsError::InvalidValue { name, value }) => {
                assert_eq!(name, "video_codec");
                assert_eq!(value, "vp9");
            }
            Ok(_) => panic!("Expected settings to be rejected"),
        }

        let config = parse("settings {\n    transcoder_arguments\n}\n").unwrap();
        match AppSettings::from_config(&config, Path::new("logs")) {
            Err(SettingsError::InvalidValue { name, .. }) => {
                assert_eq!(name, "transcoder_arguments")
            }
            Ok(_) => panic!("Expected an empty template to be rejected"),
        }
    }
}
