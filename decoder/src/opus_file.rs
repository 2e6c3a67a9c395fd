//! Ogg Opus demux + decode + metadata extraction in a single pass.

use ogg::PacketReader;
use opus::Channels;
use raop_common::gain::{db_to_linear, scale_samples};
use raop_common::pcm::{RAOP_CHANNELS, RAOP_SAMPLE_RATE};
use raop_common::{PcmSource, SessionLink};
use std::fs;
use std::io::{self, Cursor};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::convert::{mono_to_stereo, resample_linear};
use crate::error::{DecodeError, Result};
use crate::headers::{is_opus_tags, OpusHead, OPUS_RATE};
use crate::tags::{AlbumArt, TrackTags};

/// Largest Opus frame: 120 ms at 48 kHz
const MAX_FRAME_SAMPLES: usize = 5760;

const OGG_CAPTURE: &[u8; 4] = b"OggS";

/// Everything the player needs about one decoded file.
#[derive(Debug, Clone)]
pub struct Track {
    // ---
    pub artist: String,
    pub album: String,
    pub title: String,
    pub track_number: String,
    pub album_art: Option<AlbumArt>,
    pub duration: Duration,

    /// 44.1 kHz interleaved stereo, ready for a streaming session
    pub pcm: PcmSource,
}

struct Decoded {
    tags: TrackTags,
    pcm: PcmSource,
    duration: Duration,
}

/// Decoder for one Ogg Opus source.
///
/// Construction only checks that the source is an Ogg stream starting with
/// an `OpusHead`; [`OpusDecoder::decode`] does the real work. Until a
/// successful decode every metadata accessor returns its default and every
/// PCM accessor fails with [`DecodeError::NotDecoded`].
///
/// The decoder may carry a [`SessionLink`] to the session playing it. The
/// link is weak: the decoder forwards gain changes but never keeps the
/// session alive or controls its lifecycle.
pub struct OpusDecoder {
    // ---
    /// Path or `<memory>`, for log messages
    origin: String,
    bytes: Vec<u8>,
    decoded: Option<Decoded>,
    last_error: Option<DecodeError>,
    session: Option<SessionLink>,

    /// f32 bits of the gain to apply to the linked session, in dB
    replay_gain_db: AtomicU32,
}

impl OpusDecoder {
    // ---
    /// Opens an Ogg Opus file.
    ///
    /// # Errors
    ///
    /// - `SourceNotFound` if the path does not exist
    /// - `UnsupportedFormat` if it is not an Ogg stream carrying Opus
    /// - `MalformedData` if the first page cannot be read
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        // ---
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => DecodeError::SourceNotFound(path.to_path_buf()),
            _ => DecodeError::MalformedData(format!("failed to read {}: {}", path.display(), e)),
        })?;

        Self::with_origin(bytes, path.display().to_string())
    }

    /// Wraps an Ogg Opus stream that is already in memory.
    ///
    /// # Errors
    ///
    /// - `MalformedData` if the buffer is empty or its first page is broken
    /// - `UnsupportedFormat` if it is a valid Ogg stream that is not Opus
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        // ---
        Self::with_origin(bytes.into(), "<memory>".to_string())
    }

    fn with_origin(bytes: Vec<u8>, origin: String) -> Result<Self> {
        // ---
        let head = read_identification(&bytes)?;
        debug!(
            "Opened {}: {} channel(s), pre-skip {}, input rate {}Hz",
            origin, head.channels, head.pre_skip, head.input_sample_rate
        );

        Ok(Self {
            origin,
            bytes,
            decoded: None,
            last_error: None,
            session: None,
            replay_gain_db: AtomicU32::new(0f32.to_bits()),
        })
    }

    /// Demuxes and decodes the whole stream.
    ///
    /// Returns `true` on success. A second call after success is a no-op;
    /// a call after a failure retries from scratch. On failure metadata stays
    /// at its defaults and the reason is available from [`Self::last_error`].
    pub fn decode(&mut self) -> bool {
        // ---
        if self.decoded.is_some() {
            return true;
        }

        match decode_stream(&self.bytes) {
            Ok(decoded) => {
                info!(
                    "Decoded {}: {:.2}s, \"{}\" by \"{}\"",
                    self.origin,
                    decoded.duration.as_secs_f64(),
                    decoded.tags.title,
                    decoded.tags.artist
                );
                self.decoded = Some(decoded);
                self.last_error = None;
                true
            }
            Err(e) => {
                warn!("Failed to decode {}: {}", self.origin, e);
                self.last_error = Some(e);
                false
            }
        }
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded.is_some()
    }

    /// Why the last [`Self::decode`] failed, if it did.
    pub fn last_error(&self) -> Option<&DecodeError> {
        self.last_error.as_ref()
    }

    /// Playable length: final granule position minus pre-skip.
    pub fn duration(&self) -> Result<Duration> {
        // ---
        self.decoded
            .as_ref()
            .map(|d| d.duration)
            .ok_or(DecodeError::NotDecoded)
    }

    /// [`Self::duration`], with zero standing in for "not decoded".
    pub fn duration_or_zero(&self) -> Duration {
        self.duration().unwrap_or_default()
    }

    /// A fresh cursor over the decoded PCM.
    pub fn pcm(&self) -> Result<PcmSource> {
        // ---
        self.decoded
            .as_ref()
            .map(|d| d.pcm.clone())
            .ok_or(DecodeError::NotDecoded)
    }

    /// Metadata and PCM bundled for the orchestrator.
    pub fn track(&self) -> Result<Track> {
        // ---
        let decoded = self.decoded.as_ref().ok_or(DecodeError::NotDecoded)?;
        Ok(Track {
            artist: decoded.tags.artist.clone(),
            album: decoded.tags.album.clone(),
            title: decoded.tags.title.clone(),
            track_number: decoded.tags.track_number.clone(),
            album_art: decoded.tags.album_art.clone(),
            duration: decoded.duration,
            pcm: decoded.pcm.clone(),
        })
    }

    pub fn artist(&self) -> &str {
        self.tag(|t| &t.artist)
    }

    pub fn album(&self) -> &str {
        self.tag(|t| &t.album)
    }

    pub fn title(&self) -> &str {
        self.tag(|t| &t.title)
    }

    pub fn track_number(&self) -> &str {
        self.tag(|t| &t.track_number)
    }

    pub fn album_art(&self) -> Option<&AlbumArt> {
        self.decoded.as_ref()?.tags.album_art.as_ref()
    }

    /// Track gain found in the tags, if any.
    pub fn tag_replay_gain_db(&self) -> Option<f32> {
        self.decoded.as_ref()?.tags.replay_gain_db
    }

    fn tag<'a>(&'a self, field: impl Fn(&'a TrackTags) -> &'a String) -> &'a str {
        self.decoded.as_ref().map_or("", |d| field(&d.tags).as_str())
    }

    /// Associates the session that plays this track.
    pub fn attach_session(&mut self, link: SessionLink) {
        // ---
        self.session = Some(link);
    }

    pub fn detach_session(&mut self) {
        self.session = None;
    }

    pub fn replay_gain_db(&self) -> f32 {
        f32::from_bits(self.replay_gain_db.load(Ordering::Acquire))
    }

    /// Stores the gain and forwards it to the linked session if it is alive.
    pub fn set_replay_gain_db(&self, db: f32) {
        // ---
        self.replay_gain_db.store(db.to_bits(), Ordering::Release);

        match self.session.as_ref().and_then(|link| link.upgrade()) {
            Some(session) => session.set_gain_db(db),
            None => debug!("No live session to forward {:.2} dB to", db),
        }
    }
}

/// Checks the container and reads the identification header.
fn read_identification(bytes: &[u8]) -> Result<OpusHead> {
    // ---
    if bytes.is_empty() {
        return Err(DecodeError::MalformedData("empty input".into()));
    }
    if !bytes.starts_with(OGG_CAPTURE) {
        return Err(DecodeError::UnsupportedFormat(
            "not an Ogg container".into(),
        ));
    }

    let mut reader = PacketReader::new(Cursor::new(bytes));
    match reader.read_packet() {
        Ok(Some(packet)) => OpusHead::parse(&packet.data),
        Ok(None) => Err(DecodeError::MalformedData("no packets in stream".into())),
        Err(e) => Err(DecodeError::MalformedData(format!("unreadable first page: {e}"))),
    }
}

fn decode_stream(bytes: &[u8]) -> Result<Decoded> {
    // ---
    let mut reader = PacketReader::new(Cursor::new(bytes));
    let mut next_packet = || {
        reader
            .read_packet()
            .map_err(|e| DecodeError::MalformedData(format!("Ogg read failed: {e}")))
    };

    let head_packet =
        next_packet()?.ok_or_else(|| DecodeError::MalformedData("missing OpusHead".into()))?;
    let head = OpusHead::parse(&head_packet.data)?;
    let serial = head_packet.stream_serial();

    let tags_packet =
        next_packet()?.ok_or_else(|| DecodeError::MalformedData("missing OpusTags".into()))?;
    if !is_opus_tags(&tags_packet.data) {
        return Err(DecodeError::MalformedData(
            "second packet is not OpusTags".into(),
        ));
    }
    let tags = TrackTags::read(bytes)?;

    let channels = head.channels as usize;
    let layout = if channels == 1 {
        Channels::Mono
    } else {
        Channels::Stereo
    };
    let mut codec = opus::Decoder::new(OPUS_RATE, layout)
        .map_err(|e| DecodeError::MalformedData(format!("failed to create Opus decoder: {e}")))?;

    let mut pcm: Vec<i16> = Vec::new();
    let mut frame = vec![0i16; MAX_FRAME_SAMPLES * channels];
    let mut final_granule: Option<u64> = None;
    let mut packets = 0usize;

    while let Some(packet) = next_packet()? {
        if packet.stream_serial() != serial {
            continue;
        }

        let decoded = codec
            .decode(&packet.data, &mut frame, false)
            .map_err(|e| DecodeError::MalformedData(format!("Opus packet {packets}: {e}")))?;
        pcm.extend_from_slice(&frame[..decoded * channels]);
        packets += 1;

        let granule = packet.absgp_page();
        if granule != u64::MAX {
            final_granule = Some(granule);
        }
    }

    let pre_skip = head.pre_skip as usize;
    let decoded_frames = (pcm.len() / channels).saturating_sub(pre_skip);
    let playable = final_granule
        .map(|g| (g as usize).saturating_sub(pre_skip))
        .unwrap_or(decoded_frames)
        .min(decoded_frames);

    if playable == 0 {
        return Err(DecodeError::MalformedData(format!(
            "no playable audio in {packets} packet(s)"
        )));
    }

    debug!(
        "Decoded {} packets: {} frames after pre-skip, {} playable",
        packets, decoded_frames, playable
    );

    let trimmed = &pcm[pre_skip * channels..(pre_skip + playable) * channels];
    let mut stereo = if channels == 1 {
        mono_to_stereo(trimmed)
    } else {
        trimmed.to_vec()
    };
    scale_samples(&mut stereo, db_to_linear(head.output_gain_db()));

    let resampled = resample_linear(
        &stereo,
        RAOP_CHANNELS as usize,
        OPUS_RATE,
        RAOP_SAMPLE_RATE,
    );

    Ok(Decoded {
        tags,
        pcm: PcmSource::new(resampled, RAOP_CHANNELS, RAOP_SAMPLE_RATE),
        duration: Duration::from_secs_f64(playable as f64 / OPUS_RATE as f64),
    })
}
