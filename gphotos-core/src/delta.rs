//! Decoding of library delta pages.
//!
//! The remote protocol nests item metadata several levels deep and populates
//! it sparsely. Everything here is flattened into [`MediaRecord`] and a plain
//! list of deleted media keys before it leaves the crate.

use serde::Deserialize;
use tracing::debug;

use crate::client::PhotosError;
use crate::media::{MediaRecord, MediaType, decode_any_base64, dedup_key_from_bytes};

/// Deletion discriminant that identifies a removed media item.
pub const DELETION_KIND_MEDIA: i64 = 1;

/// Item property marking a re-encoded variant of another item.
const PROPERTY_NON_CANONICAL: i64 = 27;

/// One unit of the incremental sync protocol.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeltaPage {
    /// Empty when the response carried no state token (page responses).
    pub state_token: String,
    /// Empty when there is no further page.
    pub page_token: String,
    pub items: Vec<MediaRecord>,
    pub deleted_keys: Vec<String>,
}

impl DeltaPage {
    pub fn has_next_page(&self) -> bool {
        !self.page_token.is_empty()
    }
}

pub fn decode_page(bytes: &[u8]) -> Result<DeltaPage, PhotosError> {
    let wire: WirePage =
        serde_json::from_slice(bytes).map_err(|err| PhotosError::Decode(err.to_string()))?;

    let items = wire
        .items
        .into_iter()
        .map(WireItem::into_record)
        .collect::<Result<Vec<_>, _>>()?;

    let deleted_keys = wire
        .deletions
        .into_iter()
        .filter_map(WireDeletion::into_media_key)
        .collect();

    Ok(DeltaPage {
        state_token: wire.state_token.unwrap_or_default(),
        page_token: wire.page_token.unwrap_or_default(),
        items,
        deleted_keys,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePage {
    #[serde(default)]
    state_token: Option<String>,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    items: Vec<WireItem>,
    #[serde(default)]
    deletions: Vec<WireDeletion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireItem {
    #[serde(default)]
    media_key: Option<String>,
    #[serde(default)]
    info: WireInfo,
    #[serde(default)]
    media: WireMedia,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInfo {
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    dedup_key: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    media_type: Option<i64>,
    #[serde(default)]
    size_bytes: Option<i64>,
    #[serde(default)]
    content_version: Option<i64>,
    #[serde(default)]
    timestamps: WireTimestamps,
    #[serde(default)]
    hash: Option<WireHash>,
    #[serde(default)]
    flags: WireFlags,
    #[serde(default)]
    properties: Vec<i64>,
    #[serde(default)]
    location: Option<WireLocation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTimestamps {
    #[serde(default)]
    utc_millis: Option<i64>,
    #[serde(default)]
    server_creation_millis: Option<i64>,
    #[serde(default)]
    timezone_offset_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireHash {
    #[serde(default)]
    sha1: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFlags {
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    favorite: bool,
    #[serde(default)]
    locked: bool,
    #[serde(default)]
    original_quality: bool,
}

#[derive(Debug, Deserialize)]
struct WireLocation {
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireMedia {
    #[serde(default)]
    photo: Option<WirePhoto>,
    #[serde(default)]
    video: Option<WireVideo>,
}

#[derive(Debug, Deserialize)]
struct WirePhoto {
    #[serde(default)]
    width: Option<i64>,
    #[serde(default)]
    height: Option<i64>,
    #[serde(default)]
    exif: Option<WireExif>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireExif {
    #[serde(default)]
    make: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    aperture: Option<f64>,
    #[serde(default)]
    shutter_speed: Option<f64>,
    #[serde(default)]
    iso: Option<i64>,
    #[serde(default)]
    focal_length: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireVideo {
    #[serde(default)]
    width: Option<i64>,
    #[serde(default)]
    height: Option<i64>,
    #[serde(default)]
    duration_millis: Option<i64>,
    #[serde(default)]
    capture_frame_rate: Option<f64>,
    #[serde(default)]
    encoded_frame_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireDeletion {
    #[serde(rename = "type", default)]
    kind: i64,
    #[serde(default)]
    media: Option<WireDeletedMedia>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDeletedMedia {
    #[serde(default)]
    media_key: Option<String>,
}

impl WireItem {
    fn into_record(self) -> Result<MediaRecord, PhotosError> {
        let media_key = self
            .media_key
            .filter(|key| !key.is_empty())
            .ok_or_else(|| PhotosError::Decode("delta item without media key".into()))?;
        let info = self.info;

        let content_hash = info.hash.and_then(|hash| hash.sha1).filter(|h| !h.is_empty());
        let dedup_key = info
            .dedup_key
            .filter(|key| !key.is_empty())
            .or_else(|| {
                content_hash
                    .as_deref()
                    .and_then(decode_any_base64)
                    .map(|bytes| dedup_key_from_bytes(&bytes))
            })
            .unwrap_or_else(|| media_key.clone());

        let mut record = MediaRecord {
            file_name: info.file_name.unwrap_or_default(),
            dedup_key,
            is_canonical: !info.properties.contains(&PROPERTY_NON_CANONICAL),
            media_type: MediaType::from_code(info.media_type.unwrap_or_default()),
            caption: info.caption,
            size_bytes: info.size_bytes.unwrap_or_default(),
            content_version: info.content_version,
            utc_timestamp_millis: info.timestamps.utc_millis.unwrap_or_default(),
            server_creation_timestamp_millis: info
                .timestamps
                .server_creation_millis
                .unwrap_or_default(),
            timezone_offset_minutes: info.timestamps.timezone_offset_minutes.unwrap_or_default(),
            is_archived: info.flags.archived,
            is_favorite: info.flags.favorite,
            is_locked: info.flags.locked,
            is_original_quality: info.flags.original_quality,
            content_hash,
            media_key,
            ..MediaRecord::default()
        };

        if let Some(location) = info.location {
            record.latitude = location.latitude;
            record.longitude = location.longitude;
            record.location_name = location.name;
        }

        if let Some(photo) = self.media.photo {
            record.width = photo.width;
            record.height = photo.height;
            if let Some(exif) = photo.exif {
                record.make = exif.make;
                record.model = exif.model;
                record.aperture = exif.aperture;
                record.shutter_speed = exif.shutter_speed;
                record.iso = exif.iso;
                record.focal_length = exif.focal_length;
            }
        }
        if let Some(video) = self.media.video {
            record.width = video.width.or(record.width);
            record.height = video.height.or(record.height);
            record.duration_millis = video.duration_millis;
            record.capture_frame_rate = video.capture_frame_rate;
            record.encoded_frame_rate = video.encoded_frame_rate;
        }

        Ok(record)
    }
}

impl WireDeletion {
    fn into_media_key(self) -> Option<String> {
        if self.kind != DELETION_KIND_MEDIA {
            debug!(kind = self.kind, "skipping deletion entry of unknown kind");
            return None;
        }
        self.media
            .and_then(|media| media.media_key)
            .filter(|key| !key.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_nested_item_metadata() {
        let body = json!({
            "stateToken": "s1",
            "pageToken": "p1",
            "items": [{
                "mediaKey": "AF1Qip-A",
                "info": {
                    "fileName": "IMG_0001.jpg",
                    "mediaType": 1,
                    "sizeBytes": 2048,
                    "timestamps": {
                        "utcMillis": 1_700_000_000_000i64,
                        "serverCreationMillis": 1_700_000_100_000i64,
                        "timezoneOffsetMinutes": 120
                    },
                    "hash": { "sha1": "qvTGHdzF6KLavt4PO0gs2a6pQ00=" },
                    "flags": { "favorite": true, "originalQuality": true },
                    "location": { "latitude": 52.5, "longitude": 13.4, "name": "Berlin" }
                },
                "media": {
                    "photo": {
                        "width": 4000,
                        "height": 3000,
                        "exif": { "make": "Google", "model": "Pixel XL", "iso": 100 }
                    }
                }
            }]
        });

        let page = decode_page(body.to_string().as_bytes()).unwrap();

        assert_eq!(page.state_token, "s1");
        assert!(page.has_next_page());
        let item = &page.items[0];
        assert_eq!(item.media_key, "AF1Qip-A");
        assert_eq!(item.file_name, "IMG_0001.jpg");
        assert_eq!(item.media_type, MediaType::Photo);
        assert_eq!(item.size_bytes, 2048);
        assert_eq!(item.timezone_offset_minutes, 120);
        assert_eq!(item.dedup_key, "qvTGHdzF6KLavt4PO0gs2a6pQ00");
        assert!(item.is_canonical);
        assert!(item.is_favorite);
        assert!(!item.is_archived);
        assert_eq!(item.width, Some(4000));
        assert_eq!(item.make.as_deref(), Some("Google"));
        assert_eq!(item.iso, Some(100));
        assert_eq!(item.location_name.as_deref(), Some("Berlin"));
        assert_eq!(item.parsed_name, None);
    }

    #[test]
    fn dedup_key_falls_back_to_media_key() {
        let body = json!({
            "items": [
                { "mediaKey": "M1", "info": { "dedupKey": "explicit" } },
                { "mediaKey": "M2", "info": { "properties": [3, 27] } }
            ]
        });

        let page = decode_page(body.to_string().as_bytes()).unwrap();

        assert_eq!(page.items[0].dedup_key, "explicit");
        assert_eq!(page.items[1].dedup_key, "M2");
        assert!(!page.items[1].is_canonical);
        assert_eq!(page.state_token, "");
        assert!(!page.has_next_page());
    }

    #[test]
    fn only_media_deletions_yield_keys() {
        let body = json!({
            "deletions": [
                { "type": 1, "media": { "mediaKey": "gone" } },
                { "type": 4, "media": { "mediaKey": "album-thing" } },
                { "type": 1 },
                { "type": 7 }
            ]
        });

        let page = decode_page(body.to_string().as_bytes()).unwrap();

        assert_eq!(page.deleted_keys, vec!["gone".to_string()]);
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        assert!(matches!(
            decode_page(b"{not json"),
            Err(PhotosError::Decode(_))
        ));
        let missing_key = json!({ "items": [{ "info": { "fileName": "x" } }] });
        assert!(matches!(
            decode_page(missing_key.to_string().as_bytes()),
            Err(PhotosError::Decode(_))
        ));
    }
}
