//! In-process packet copy on top of libavformat.

use std::path::Path;

use ffmpeg_next as ffmpeg;
use ffmpeg::{codec, encoder, format, media, Rational};

use super::error::{ConversionError, ConversionResult};
use super::remux::{Demuxer, Muxer};
use super::types::{Packet, TrackInfo, TrackKind};

fn framework(context: &str, err: ffmpeg::Error) -> ConversionError {
    ConversionError::Framework(format!("{context}: {err}"))
}

pub fn open(
    source: &Path,
    output: &Path,
) -> ConversionResult<(Box<dyn Demuxer>, Box<dyn Muxer>)> {
    ffmpeg::init().map_err(|err| framework("libav init", err))?;
    let input = format::input(&source).map_err(|err| ConversionError::UnreadableSource {
        path: source.to_path_buf(),
        reason: err.to_string(),
    })?;
    let tracks = input.streams().map(|stream| track_info(&stream)).collect();
    let inputs = input
        .streams()
        .map(|stream| (stream.parameters(), stream.time_base()))
        .collect();
    let size = std::fs::metadata(source).map(|m| m.len()).unwrap_or(0);
    let context = format::output_as(&output, "mp4")
        .map_err(|err| framework("cannot create output", err))?;
    Ok((
        Box::new(LibavDemuxer {
            input,
            tracks,
            size,
            position: 0,
        }),
        Box::new(LibavMuxer {
            output: context,
            inputs,
            time_bases: Vec::new(),
        }),
    ))
}

fn track_info(stream: &format::stream::Stream<'_>) -> TrackInfo {
    let parameters = stream.parameters();
    let kind = match parameters.medium() {
        media::Type::Video => TrackKind::Video,
        media::Type::Audio => TrackKind::Audio,
        media::Type::Subtitle => TrackKind::Subtitle,
        media::Type::Data => TrackKind::Data,
        _ => TrackKind::Other,
    };
    // SAFETY: the parameters pointer is valid for the lifetime of `stream`.
    let (width, height) = unsafe {
        let raw = parameters.as_ptr();
        ((*raw).width, (*raw).height)
    };
    let dimension = |value: i32| u32::try_from(value).ok().filter(|v| *v > 0);
    let time_base = stream.time_base();
    TrackInfo {
        index: stream.index(),
        kind,
        codec: parameters.id().name().to_string(),
        time_base: (time_base.numerator(), time_base.denominator()),
        width: dimension(width),
        height: dimension(height),
        language: stream.metadata().get("language").map(str::to_string),
    }
}

struct LibavDemuxer {
    input: format::context::Input,
    tracks: Vec<TrackInfo>,
    size: u64,
    position: u64,
}

impl Demuxer for LibavDemuxer {
    fn tracks(&self) -> &[TrackInfo] {
        &self.tracks
    }

    fn read_packet(&mut self) -> ConversionResult<Option<Packet>> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(None),
            Err(err) => return Err(framework("packet read failed", err)),
        }
        if let Ok(position) = u64::try_from(packet.position()) {
            self.position = self.position.max(position);
        }
        Ok(Some(Packet {
            stream: packet.stream(),
            dts: packet.dts(),
            pts: packet.pts(),
            duration: packet.duration(),
            keyframe: packet.is_key(),
            data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
        }))
    }

    fn progress(&self) -> Option<f64> {
        (self.size > 0).then(|| self.position as f64 / self.size as f64)
    }
}

struct LibavMuxer {
    output: format::context::Output,
    inputs: Vec<(codec::Parameters, Rational)>,
    /// Input time base per output stream.
    time_bases: Vec<Rational>,
}

impl Muxer for LibavMuxer {
    fn add_stream(&mut self, track: &TrackInfo) -> ConversionResult<usize> {
        let (parameters, time_base) = self.inputs.get(track.index).cloned().ok_or_else(|| {
            ConversionError::Framework(format!("input stream {} not found", track.index))
        })?;
        let mut stream = self
            .output
            .add_stream(encoder::find(codec::Id::None))
            .map_err(|err| framework("cannot add output stream", err))?;
        stream.set_parameters(parameters);
        // SAFETY: the stream owns its parameters; clearing the tag lets the
        // muxer pick one valid for the target container.
        unsafe {
            (*stream.parameters().as_mut_ptr()).codec_tag = 0;
        }
        let index = stream.index();
        self.time_bases.push(time_base);
        Ok(index)
    }

    fn write_header(&mut self) -> ConversionResult<()> {
        self.output
            .write_header()
            .map_err(|err| framework("cannot write header", err))
    }

    fn write_packet(&mut self, stream: usize, packet: Packet) -> ConversionResult<()> {
        let input_base = *self.time_bases.get(stream).ok_or_else(|| {
            ConversionError::Framework(format!("output stream {stream} not declared"))
        })?;
        let output_base = self
            .output
            .stream(stream)
            .map(|s| s.time_base())
            .ok_or_else(|| ConversionError::Framework(format!("output stream {stream} missing")))?;
        let mut out = ffmpeg::Packet::copy(&packet.data);
        out.set_dts(packet.dts);
        out.set_pts(packet.pts);
        out.set_duration(packet.duration);
        if packet.keyframe {
            out.set_flags(ffmpeg::packet::Flags::KEY);
        }
        out.set_stream(stream);
        out.rescale_ts(input_base, output_base);
        out.set_position(-1);
        out.write_interleaved(&mut self.output)
            .map_err(|err| framework("packet write failed", err))
    }

    fn finish(&mut self) -> ConversionResult<()> {
        self.output
            .write_trailer()
            .map_err(|err| framework("cannot write trailer", err))
    }
}
