//! Asset model: logical identity, descriptive metadata and immutable bytes.

use cas::ContentHash;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Maximum asset name length in characters.
pub const MAX_ASSET_NAME: usize = 64;

/// Maximum asset description length in characters.
pub const MAX_ASSET_DESC: usize = 64;

/// Id returned by `store` when the metadata store rejected the record.
pub const ZERO_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Simulator asset type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i8", into = "i8")]
pub enum AssetType {
    #[default]
    Unknown,
    Texture,
    Sound,
    CallingCard,
    Landmark,
    Clothing,
    /// Serialized scene object (XML).
    Object,
    Notecard,
    Folder,
    LslText,
    LslBytecode,
    TextureTga,
    Bodypart,
    SoundWav,
    ImageTga,
    ImageJpeg,
    Animation,
    Gesture,
    Simstate,
    Link,
    LinkFolder,
    Mesh,
    Other(i8),
}

impl AssetType {
    /// Numeric type code as used on the wire and in metadata stores.
    pub fn code(self) -> i8 {
        match self {
            AssetType::Unknown => -1,
            AssetType::Texture => 0,
            AssetType::Sound => 1,
            AssetType::CallingCard => 2,
            AssetType::Landmark => 3,
            AssetType::Clothing => 5,
            AssetType::Object => 6,
            AssetType::Notecard => 7,
            AssetType::Folder => 8,
            AssetType::LslText => 10,
            AssetType::LslBytecode => 11,
            AssetType::TextureTga => 12,
            AssetType::Bodypart => 13,
            AssetType::SoundWav => 17,
            AssetType::ImageTga => 18,
            AssetType::ImageJpeg => 19,
            AssetType::Animation => 20,
            AssetType::Gesture => 21,
            AssetType::Simstate => 22,
            AssetType::Link => 24,
            AssetType::LinkFolder => 25,
            AssetType::Mesh => 49,
            AssetType::Other(code) => code,
        }
    }

    /// MIME type for this asset type.
    pub fn content_type(self) -> &'static str {
        match self {
            AssetType::Texture => "image/x-j2c",
            AssetType::Sound => "audio/ogg",
            AssetType::CallingCard => "application/vnd.ll.callingcard",
            AssetType::Landmark => "application/vnd.ll.landmark",
            AssetType::Clothing => "application/vnd.ll.clothing",
            AssetType::Object => "application/vnd.ll.primitive",
            AssetType::Notecard => "application/vnd.ll.notecard",
            AssetType::Folder => "application/vnd.ll.folder",
            AssetType::LslText => "application/vnd.ll.lsltext",
            AssetType::LslBytecode => "application/vnd.ll.lslbyte",
            AssetType::TextureTga | AssetType::ImageTga => "image/tga",
            AssetType::Bodypart => "application/vnd.ll.bodypart",
            AssetType::SoundWav => "audio/x-wav",
            AssetType::ImageJpeg => "image/jpeg",
            AssetType::Animation => "application/vnd.ll.animation",
            AssetType::Gesture => "application/vnd.ll.gesture",
            AssetType::Simstate => "application/x-metaverse-simstate",
            AssetType::Link => "application/vnd.ll.link",
            AssetType::LinkFolder => "application/vnd.ll.linkfolder",
            AssetType::Mesh => "application/vnd.ll.mesh",
            AssetType::Unknown | AssetType::Other(_) => "application/octet-stream",
        }
    }
}

impl From<i8> for AssetType {
    fn from(code: i8) -> Self {
        match code {
            -1 => AssetType::Unknown,
            0 => AssetType::Texture,
            1 => AssetType::Sound,
            2 => AssetType::CallingCard,
            3 => AssetType::Landmark,
            5 => AssetType::Clothing,
            6 => AssetType::Object,
            7 => AssetType::Notecard,
            8 => AssetType::Folder,
            10 => AssetType::LslText,
            11 => AssetType::LslBytecode,
            12 => AssetType::TextureTga,
            13 => AssetType::Bodypart,
            17 => AssetType::SoundWav,
            18 => AssetType::ImageTga,
            19 => AssetType::ImageJpeg,
            20 => AssetType::Animation,
            21 => AssetType::Gesture,
            22 => AssetType::Simstate,
            24 => AssetType::Link,
            25 => AssetType::LinkFolder,
            49 => AssetType::Mesh,
            other => AssetType::Other(other),
        }
    }
}

impl From<AssetType> for i8 {
    fn from(t: AssetType) -> Self {
        t.code()
    }
}

/// Descriptive metadata of an asset. Persisted only through the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(rename = "type")]
    pub asset_type: AssetType,

    #[serde(default)]
    pub flags: u32,

    #[serde(default)]
    pub creator_id: String,

    #[serde(default)]
    pub content_type: String,

    #[serde(default)]
    pub local: bool,

    #[serde(default)]
    pub temporary: bool,
}

/// An asset: logical identity, descriptor and bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Logical id. Usually a UUID, but any string is accepted.
    pub id: String,

    /// UUID form of the id.
    #[serde(default)]
    pub full_id: Uuid,

    #[serde(flatten)]
    pub descriptor: AssetDescriptor,

    #[serde(skip)]
    pub data: Vec<u8>,
}

impl Asset {
    /// Create a new asset with minimal fields.
    pub fn new(id: impl Into<String>, asset_type: AssetType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            full_id: Uuid::nil(),
            descriptor: AssetDescriptor {
                asset_type,
                content_type: asset_type.content_type().to_string(),
                ..Default::default()
            },
            data: data.into(),
        }
    }

    /// Builder: set name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.descriptor.name = name.into();
        self
    }

    /// Builder: set description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.descriptor.description = description.into();
        self
    }

    /// Builder: set creator.
    pub fn with_creator(mut self, creator_id: impl Into<String>) -> Self {
        self.descriptor.creator_id = creator_id.into();
        self
    }

    /// Builder: set flags.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.descriptor.flags = flags;
        self
    }

    /// The asset type.
    pub fn asset_type(&self) -> AssetType {
        self.descriptor.asset_type
    }

    /// Digest of the current data.
    pub fn hash(&self) -> ContentHash {
        ContentHash::from_data(&self.data)
    }

    /// Fill in a missing id and/or full id.
    ///
    /// An empty id takes the full id (random if nil). A non-empty id with a
    /// nil full id parses the id as a UUID, or gets a random full id.
    pub fn assign_ids(&mut self) {
        if self.id.is_empty() {
            if self.full_id.is_nil() {
                self.full_id = Uuid::new_v4();
            }
            self.id = self.full_id.to_string();
        } else if self.full_id.is_nil() {
            self.full_id = Uuid::parse_str(&self.id).unwrap_or_else(|_| Uuid::new_v4());
        }
    }

    /// Clamp name and description to their maximum lengths.
    pub fn truncate_fields(&mut self) {
        if let Some(len) = truncate_chars(&mut self.descriptor.name, MAX_ASSET_NAME) {
            warn!(
                asset = %self.id,
                "name truncated from {} to {} characters on add", len, MAX_ASSET_NAME
            );
        }
        if let Some(len) = truncate_chars(&mut self.descriptor.description, MAX_ASSET_DESC) {
            warn!(
                asset = %self.id,
                "description truncated from {} to {} characters on add", len, MAX_ASSET_DESC
            );
        }
    }

    /// Repair known malformations of serialized objects in place.
    ///
    /// Only applies to [`AssetType::Object`]. Payloads that cannot be repaired
    /// are logged and left as they are.
    pub fn sanitize(&mut self) {
        if self.asset_type() != AssetType::Object || self.data.is_empty() {
            return;
        }
        match repair_object_xml(&self.data) {
            Ok(Some(fixed)) => {
                debug!(asset = %self.id, "repaired doubled xmlns prefixes");
                self.data = fixed;
            }
            Ok(None) => {}
            Err(e) => warn!(asset = %self.id, "object payload is not text, left unrepaired: {e}"),
        }
    }
}

/// Truncate `s` to `max` characters. Returns the original length if it was cut.
fn truncate_chars(s: &mut String, max: usize) -> Option<usize> {
    let len = s.chars().count();
    if len <= max {
        return None;
    }
    if let Some((cut, _)) = s.char_indices().nth(max) {
        s.truncate(cut);
    }
    Some(len)
}

const DOUBLED_XMLNS: &str = "xmlns:xmlns:";

/// Collapse repeated `xmlns:` prefixes in serialized object XML.
///
/// Returns `Ok(None)` when the payload needs no repair.
pub fn repair_object_xml(data: &[u8]) -> Result<Option<Vec<u8>>, std::str::Utf8Error> {
    let text = std::str::from_utf8(data)?;
    if !text.contains(DOUBLED_XMLNS) {
        return Ok(None);
    }

    let mut fixed = text.to_string();
    while fixed.contains(DOUBLED_XMLNS) {
        fixed = fixed.replace(DOUBLED_XMLNS, "xmlns:");
    }
    Ok(Some(fixed.into_bytes()))
}
