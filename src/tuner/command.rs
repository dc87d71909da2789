//! Stream selector parsing and child-process argument construction.
//!
//! The demodulator tunes by virtual channel number and writes raw MPEG-TS to
//! stdout; the transcoder reads that stream from stdin and produces the
//! selected container/codec on stdout.

use std::path::Path;

use serde::Serialize;

/// Output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Ts,
    Mkv,
    Mp4,
}

impl Container {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ts" | "mpegts" => Some(Container::Ts),
            "mkv" | "matroska" => Some(Container::Mkv),
            "mp4" => Some(Container::Mp4),
            _ => None,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Container::Ts => "video/mp2t",
            Container::Mkv => "video/x-matroska",
            Container::Mp4 => "video/mp4",
        }
    }

    fn muxer(self) -> &'static str {
        match self {
            Container::Ts => "mpegts",
            Container::Mkv => "matroska",
            Container::Mp4 => "mp4",
        }
    }
}

/// Output video codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Copy,
    H264,
    H265,
    Av1,
}

impl Codec {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "copy" => Some(Codec::Copy),
            "h264" | "264" | "avc" => Some(Codec::H264),
            "h265" | "265" | "hevc" => Some(Codec::H265),
            "av1" => Some(Codec::Av1),
            _ => None,
        }
    }
}

/// Transcode engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    None,
    Soft,
    Qsv,
    Nvenc,
    Vaapi,
}

impl Engine {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Engine::None),
            "soft" | "software" => Some(Engine::Soft),
            "qsv" => Some(Engine::Qsv),
            "nvenc" => Some(Engine::Nvenc),
            "vaapi" => Some(Engine::Vaapi),
            _ => None,
        }
    }
}

/// A fully resolved output format for one stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamFormat {
    pub container: Container,
    pub codec: Codec,
    pub engine: Engine,
}

impl StreamFormat {
    /// Resolve request selectors against the configured defaults.
    ///
    /// Unrecognised selector strings fall back to the defaults. An `av1`
    /// codec with no explicit container prefers mkv; a non-copy codec with
    /// engine `none` is upgraded to the software engine.
    pub fn resolve(
        container: Option<&str>,
        codec: Option<&str>,
        engine: Option<&str>,
        default_engine: Engine,
        default_codec: Codec,
    ) -> Self {
        let codec = codec.and_then(Codec::parse).unwrap_or(default_codec);
        let container = match container.and_then(Container::parse) {
            Some(c) => c,
            None if codec == Codec::Av1 => Container::Mkv,
            None => Container::Ts,
        };
        let selected = engine.and_then(Engine::parse).unwrap_or(default_engine);
        let engine = match codec {
            Codec::Copy => Engine::None,
            _ if selected == Engine::None => Engine::Soft,
            _ => selected,
        };
        Self {
            container,
            codec,
            engine,
        }
    }
}

/// Build the demodulator argument list.
///
/// The tuning key is the virtual channel number, never the channel name.
/// A duration is passed for time-bounded EPG captures.
pub fn demodulator_args(
    conf: &Path,
    adapter: usize,
    channel_number: &str,
    duration_secs: Option<u64>,
) -> Vec<String> {
    let mut args = vec![
        "-c".to_string(),
        conf.to_string_lossy().into_owned(),
        "-r".to_string(),
        "-a".to_string(),
        adapter.to_string(),
        "-o".to_string(),
        "-".to_string(),
    ];
    if let Some(secs) = duration_secs {
        args.push("-t".to_string());
        args.push(secs.to_string());
    }
    args.push(channel_number.to_string());
    args
}

/// Build the transcoder argument list for the resolved format.
pub fn transcoder_args(fmt: &StreamFormat) -> Vec<String> {
    let mut args: Vec<&str> = vec!["-hide_banner", "-loglevel", "warning", "-fflags", "+genpts"];

    // Hardware device setup precedes the input.
    match fmt.engine {
        Engine::Nvenc => {
            args.extend(["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"]);
        }
        Engine::Qsv => {
            args.extend([
                "-init_hw_device",
                "qsv=hw",
                "-filter_hw_device",
                "hw",
                "-hwaccel",
                "qsv",
            ]);
        }
        Engine::Vaapi => {
            args.extend([
                "-init_hw_device",
                "vaapi=va:/dev/dri/renderD128",
                "-filter_hw_device",
                "va",
                "-hwaccel",
                "vaapi",
                "-hwaccel_output_format",
                "vaapi",
            ]);
        }
        Engine::None | Engine::Soft => {}
    }

    args.extend(["-i", "pipe:0"]);

    if fmt.codec == Codec::Copy {
        args.extend(["-c", "copy"]);
    } else {
        match fmt.engine {
            Engine::Soft | Engine::None => match fmt.codec {
                Codec::H264 => {
                    args.extend(["-c:v", "libx264", "-preset", "ultrafast", "-tune", "zerolatency"])
                }
                Codec::H265 => {
                    args.extend(["-c:v", "libx265", "-preset", "ultrafast", "-tune", "zerolatency"])
                }
                Codec::Av1 => args.extend(["-c:v", "libsvtav1", "-preset", "10"]),
                Codec::Copy => unreachable!(),
            },
            Engine::Nvenc => {
                let enc = match fmt.codec {
                    Codec::H264 => "h264_nvenc",
                    Codec::H265 => "hevc_nvenc",
                    Codec::Av1 => "av1_nvenc",
                    Codec::Copy => unreachable!(),
                };
                args.extend(["-c:v", enc, "-preset", "p1", "-tune", "ll"]);
            }
            Engine::Qsv => {
                let enc = match fmt.codec {
                    Codec::H264 => "h264_qsv",
                    Codec::H265 => "hevc_qsv",
                    Codec::Av1 => "av1_qsv",
                    Codec::Copy => unreachable!(),
                };
                args.extend(["-c:v", enc, "-preset", "veryfast"]);
            }
            Engine::Vaapi => {
                let enc = match fmt.codec {
                    Codec::H264 => "h264_vaapi",
                    Codec::H265 => "hevc_vaapi",
                    Codec::Av1 => "av1_vaapi",
                    Codec::Copy => unreachable!(),
                };
                args.extend(["-vf", "format=nv12|vaapi,hwupload", "-c:v", enc]);
            }
        }
        args.extend(["-c:a", "aac", "-b:a", "128k", "-ac", "2"]);
    }

    if fmt.container == Container::Mp4 {
        // Plain mp4 is not streamable; emit fragmented output.
        args.extend(["-movflags", "frag_keyframe+empty_moov+default_base_moof"]);
    }

    args.extend(["-f", fmt.container.muxer(), "pipe:1"]);
    args.into_iter().map(str::to_string).collect()
}
