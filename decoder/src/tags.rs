//! Vorbis comments and embedded cover art, read with lofty.

use image::RgbaImage;
use lofty::config::ParseOptions;
use lofty::file::AudioFile;
use lofty::ogg::{OggPictureStorage, OpusFile, VorbisComments};
use lofty::picture::{Picture, PictureType};
use lofty::tag::Accessor;
use std::borrow::Cow;
use std::io::Cursor;
use tracing::{debug, warn};

use crate::error::{DecodeError, Result};

/// Embedded cover art, decoded to RGBA pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumArt {
    // ---
    /// Format the picture was stored in, e.g. `image/png`
    pub mime_type: String,
    pub description: String,
    pub front_cover: bool,
    pub image: RgbaImage,
}

impl AlbumArt {
    // ---
    /// Decodes PNG or JPEG bytes.
    ///
    /// Returns `None` and logs a warning when the bytes are not an image
    /// this build can read; broken art never fails the track.
    pub fn from_image_bytes(
        data: &[u8],
        description: impl Into<String>,
        front_cover: bool,
    ) -> Option<Self> {
        // ---
        let decoded = match image::load_from_memory(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Ignoring album art that does not decode: {}", e);
                return None;
            }
        };
        let mime_type = image::guess_format(data)
            .map(|format| format.to_mime_type())
            .unwrap_or("application/octet-stream");

        Some(Self {
            mime_type: mime_type.to_string(),
            description: description.into(),
            front_cover,
            image: decoded.to_rgba8(),
        })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// The comment fields the player shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackTags {
    // ---
    pub artist: String,
    pub album: String,
    pub title: String,
    pub track_number: String,
    pub album_art: Option<AlbumArt>,

    /// Track gain in dB relative to the ReplayGain reference level
    pub replay_gain_db: Option<f32>,
}

impl TrackTags {
    // ---
    /// Reads the comment header of a complete Ogg Opus stream.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        // ---
        let options = ParseOptions::new().read_properties(false);
        let file = OpusFile::read_from(&mut Cursor::new(bytes), options)
            .map_err(|e| DecodeError::MalformedData(format!("unreadable OpusTags: {e}")))?;

        let comments = file.vorbis_comments();
        debug!(
            "OpusTags from {:?}: {} picture(s)",
            comments.vendor(),
            comments.pictures().len()
        );
        Ok(Self::from_comments(comments))
    }

    pub fn from_comments(comments: &VorbisComments) -> Self {
        // ---
        let text = |value: Option<Cow<'_, str>>| value.map(Cow::into_owned).unwrap_or_default();

        Self {
            artist: text(comments.artist()),
            album: text(comments.album()),
            title: text(comments.title()),
            // Kept verbatim: "3/12" is as valid as "3"
            track_number: comments.get("TRACKNUMBER").unwrap_or_default().to_string(),
            album_art: select_album_art(comments.pictures().iter().map(|(picture, _)| picture)),
            replay_gain_db: track_gain_db(comments),
        }
    }
}

/// First decodable picture, front covers first.
fn select_album_art<'a>(pictures: impl Iterator<Item = &'a Picture>) -> Option<AlbumArt> {
    // ---
    let (mut ordered, mut others): (Vec<&Picture>, Vec<&Picture>) =
        pictures.partition(|p| p.pic_type() == PictureType::CoverFront);
    ordered.append(&mut others);

    ordered.into_iter().find_map(|picture| {
        AlbumArt::from_image_bytes(
            picture.data(),
            picture.description().unwrap_or_default(),
            picture.pic_type() == PictureType::CoverFront,
        )
    })
}

/// `REPLAYGAIN_TRACK_GAIN` wins over `R128_TRACK_GAIN`.
fn track_gain_db(comments: &VorbisComments) -> Option<f32> {
    // ---
    if let Some(db) = comments.get("REPLAYGAIN_TRACK_GAIN").and_then(parse_replay_gain) {
        return Some(db);
    }

    // Q7.8 relative to -23 LUFS; ReplayGain's reference is 5 dB louder.
    comments
        .get("R128_TRACK_GAIN")
        .and_then(|value| value.trim().parse::<i16>().ok())
        .map(|q78| q78 as f32 / 256.0 + 5.0)
}

/// Parses values like `-6.52 dB` or `+1.0`.
fn parse_replay_gain(value: &str) -> Option<f32> {
    // ---
    let trimmed = value.trim();
    let number = trimmed
        .strip_suffix("dB")
        .or_else(|| trimmed.strip_suffix("db"))
        .unwrap_or(trimmed)
        .trim();
    number.parse::<f32>().ok()
}
