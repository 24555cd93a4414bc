use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use thiserror::Error;

pub const SHA1_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashFormatError {
    #[error("content hash must be {SHA1_LEN} bytes, got {0}")]
    Length(usize),
    #[error("content hash is neither hex nor base64: {0}")]
    Encoding(String),
}

/// SHA-1 digest of a file's content, the key the remote library deduplicates on.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; SHA1_LEN]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; SHA1_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashFormatError> {
        let array: [u8; SHA1_LEN] = bytes
            .try_into()
            .map_err(|_| HashFormatError::Length(bytes.len()))?;
        Ok(Self(array))
    }

    /// Accepts a 40 character hex digest or any base64 flavour of the raw digest.
    pub fn parse(value: &str) -> Result<Self, HashFormatError> {
        let value = value.trim();
        if value.len() == SHA1_LEN * 2 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
            let mut out = [0u8; SHA1_LEN];
            hex::decode_to_slice(value, &mut out)
                .map_err(|_| HashFormatError::Encoding(value.to_string()))?;
            return Ok(Self(out));
        }
        let decoded = decode_any_base64(value)
            .ok_or_else(|| HashFormatError::Encoding(value.to_string()))?;
        Self::from_slice(&decoded)
    }

    pub fn as_bytes(&self) -> &[u8; SHA1_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn dedup_key(&self) -> String {
        dedup_key_from_bytes(&self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Dedup keys are the URL-safe, unpadded base64 form of a digest or grouping id.
pub fn dedup_key_from_bytes(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub(crate) fn decode_any_base64(value: &str) -> Option<Vec<u8>> {
    STANDARD
        .decode(value)
        .or_else(|_| URL_SAFE.decode(value))
        .or_else(|_| URL_SAFE_NO_PAD.decode(value))
        .or_else(|_| STANDARD.decode(format!("{value}{}", padding_for(value))))
        .ok()
}

fn padding_for(value: &str) -> &'static str {
    match value.len() % 4 {
        2 => "==",
        3 => "=",
        _ => "",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaType {
    Photo,
    Video,
    #[default]
    Other,
}

impl MediaType {
    pub fn code(self) -> i64 {
        match self {
            MediaType::Photo => 1,
            MediaType::Video => 2,
            MediaType::Other => 0,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => MediaType::Photo,
            2 => MediaType::Video,
            _ => MediaType::Other,
        }
    }
}

/// One mirrored remote item, flattened from the delta protocol's nested shape.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaRecord {
    pub media_key: String,
    pub file_name: String,
    pub dedup_key: String,
    pub is_canonical: bool,
    pub media_type: MediaType,
    pub caption: Option<String>,
    pub size_bytes: i64,
    pub content_version: Option<i64>,
    pub utc_timestamp_millis: i64,
    pub server_creation_timestamp_millis: i64,
    pub timezone_offset_minutes: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub aperture: Option<f64>,
    pub shutter_speed: Option<f64>,
    pub iso: Option<i64>,
    pub focal_length: Option<f64>,
    pub duration_millis: Option<i64>,
    pub capture_frame_rate: Option<f64>,
    pub encoded_frame_rate: Option<f64>,
    pub is_archived: bool,
    pub is_favorite: bool,
    pub is_locked: bool,
    pub is_original_quality: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub location_name: Option<String>,
    pub content_hash: Option<String>,
    pub parsed_name: Option<String>,
}

/// Quality/device profile sent with a commit; the remote side bills storage by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadProfile {
    #[default]
    Original,
    Saver,
    UseQuota,
}

impl UploadProfile {
    pub fn quality(self) -> &'static str {
        match self {
            UploadProfile::Original | UploadProfile::UseQuota => "original",
            UploadProfile::Saver => "saver",
        }
    }

    pub fn model(self) -> &'static str {
        match self {
            UploadProfile::Original => "Pixel XL",
            UploadProfile::Saver => "Pixel 2",
            UploadProfile::UseQuota => "Pixel 8",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown upload profile: {0}")]
pub struct UnknownProfile(String);

impl FromStr for UploadProfile {
    type Err = UnknownProfile;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "original" => Ok(UploadProfile::Original),
            "saver" => Ok(UploadProfile::Saver),
            "quota" | "use-quota" | "use_quota" => Ok(UploadProfile::UseQuota),
            other => Err(UnknownProfile(other.to_string())),
        }
    }
}
