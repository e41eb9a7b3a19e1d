//! Typed model of the gateway's `[kind, {...}]` JSON pairs, and the
//! zlib-compressed JSON codec used for cached metadata blobs.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "dirnode" => Some(NodeKind::Dir),
            "filenode" | "file" => Some(NodeKind::File),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TahoeMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linkcrtime: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linkmotime: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctime: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tahoe: Option<TahoeMeta>,
}

/// Payload of a directory child entry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChildInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ro_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rw_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A directory child: `["dirnode" | "filenode", {...}]` on the wire.
#[derive(Clone, Debug)]
pub struct ChildEntry {
    pub kind: NodeKind,
    pub info: ChildInfo,
}

impl Serialize for ChildEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let tag = match self.kind {
            NodeKind::Dir => "dirnode",
            NodeKind::File => "filenode",
        };
        (tag, &self.info).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChildEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (tag, info): (String, ChildInfo) = Deserialize::deserialize(deserializer)?;
        let kind = NodeKind::from_tag(&tag)
            .ok_or_else(|| D::Error::custom(format!("unknown node kind {:?}", tag)))?;
        Ok(ChildEntry { kind, info })
    }
}

/// Metadata record of a cached file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(default)]
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ro_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rw_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieved: Option<f64>,
}

/// Metadata record of a cached directory.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DirInfo {
    #[serde(default)]
    pub children: BTreeMap<String, ChildEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ro_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rw_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieved: Option<f64>,
}

/// A full node record: `["file" | "filenode" | "dirnode", {...}]`.
#[derive(Clone, Debug)]
pub enum NodeInfo {
    File(FileInfo),
    Dir(DirInfo),
}

impl NodeInfo {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeInfo::File(_) => NodeKind::File,
            NodeInfo::Dir(_) => NodeKind::Dir,
        }
    }
}

impl Serialize for NodeInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            NodeInfo::File(info) => ("file", info).serialize(serializer),
            NodeInfo::Dir(info) => ("dirnode", info).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for NodeInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (tag, value): (String, serde_json::Value) = Deserialize::deserialize(deserializer)?;
        match NodeKind::from_tag(&tag) {
            Some(NodeKind::File) => Ok(NodeInfo::File(
                serde_json::from_value(value).map_err(D::Error::custom)?,
            )),
            Some(NodeKind::Dir) => Ok(NodeInfo::Dir(
                serde_json::from_value(value).map_err(D::Error::custom)?,
            )),
            None => Err(D::Error::custom(format!("unknown node kind {:?}", tag))),
        }
    }
}

/// Serialize to zlib-compressed JSON, the storage format of metadata blobs.
pub fn json_zlib_encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    let raw = serde_json::to_vec(value)?;
    let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(3));
    enc.write_all(&raw).map_err(|_| Error::InvalidMetadata)?;
    enc.finish().map_err(|_| Error::InvalidMetadata)
}

pub fn json_zlib_decode<T: serde::de::DeserializeOwned>(buf: &[u8]) -> Result<T, Error> {
    let mut raw = Vec::new();
    flate2::read::ZlibDecoder::new(buf)
        .read_to_end(&mut raw)
        .map_err(|_| Error::InvalidMetadata)?;
    Ok(serde_json::from_slice(&raw)?)
}
