use serde_bencode::value::Value;
use serde_derive::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use url::Url;
use crate::ID;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("metainfo has no info dictionary")]
    MissingInfo,

    #[error("torrent has no data")]
    Empty,

    #[error("piece count does not match total length")]
    PieceCountMismatch,
}

type Result<T> = std::result::Result<T, MetaInfoError>;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {

    pub path: Vec<String>,

    pub length: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

}

#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    // Suggested file name.
    pub name: String,

    // String consisting of the concatenation of all 20-byte SHA1 hash values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    // Number of bytes in each piece (integer).
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // Length of the file in bytes, single file torrents only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    // A list of dictionaries, one for each file. The files are treated
    // as a single contiguous byte range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,

}

#[derive(Clone, Deserialize, Serialize)]
pub struct MetaInfo {

    // The announce URL of the tracker, absent for trackerless torrents.
    #[serde(default)]
    #[serde(deserialize_with = "crate::de::opt_url_deserialize")]
    #[serde(serialize_with = "crate::de::opt_url_serialize")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announce: Option<Url>,

    // A dictionary that describes the file(s) of the torrent.
    pub info: Info,

    // sha1 hash of info dict
    #[serde(skip)]
    pub info_hash: ID,

    // (optional) the creation time of the torrent, in standard UNIX epoch format.
    #[serde(default)]
    #[serde(rename = "creation date")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<i64>,

    // (optional) free-form textual comments of the author (string).
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    // (optional) name and version of the program used to create the .torrent (string).
    #[serde(default)]
    #[serde(rename = "created by")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<MetaInfo> {

        let mut metainfo: MetaInfo = serde_bencode::from_bytes(raw)?;

        if metainfo.info.pieces.len() % 20 != 0 || metainfo.info.pieces.is_empty() {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        let total_len = metainfo.total_len();
        if total_len == 0 || metainfo.info.piece_length == 0 {
            return Err(MetaInfoError::Empty);
        }
        let expected = (total_len + metainfo.info.piece_length as u64 - 1) / metainfo.info.piece_length as u64;
        if expected != metainfo.num_pieces() as u64 {
            return Err(MetaInfoError::PieceCountMismatch);
        }

        metainfo.info_hash = raw_info_hash(raw)?;
        tracing::debug!("metainfo parsed: {:#?}", metainfo);
        Ok(metainfo)
    }

    // Builds a single file torrent over an in-memory buffer.
    pub fn from_data(name: &str, data: &[u8], piece_length: u32, announce: Option<Url>) -> MetaInfo {

        let pieces = data
            .chunks(piece_length as usize)
            .flat_map(|chunk| Sha1::digest(chunk).to_vec())
            .collect();

        let info = Info {
            name: name.to_string(),
            pieces,
            piece_length,
            length: Some(data.len() as u64),
            files: None,
            private: None,
        };

        let mut metainfo = MetaInfo {
            announce,
            info,
            info_hash: [0; 20],
            creation_date: Some(chrono::Utc::now().timestamp()),
            comment: None,
            created_by: Some(format!("swarm/{}", env!("CARGO_PKG_VERSION"))),
        };
        metainfo.info_hash = metainfo.info.info_hash();
        metainfo
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn piece_hashes(&self) -> Vec<ID> {
        self.info.pieces
            .chunks_exact(20)
            .map(|c| {
                let mut hash = [0; 20];
                hash.copy_from_slice(c);
                hash
            })
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> usize { self.info.pieces.len() / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> ID { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    // Formatting methods.

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            chrono::DateTime::from_timestamp(v, 0)
                .map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

impl Info {
    // Hash of our own canonical encoding, used for torrents we create.
    fn info_hash(&self) -> ID {
        let encoded = serde_bencode::to_bytes(self).unwrap_or_default();
        Sha1::digest(encoded).into()
    }
}

// The info hash must cover every key of the original info dict, including
// ones we don't model, so it is taken from the generic value tree.
fn raw_info_hash(raw: &[u8]) -> Result<ID> {
    let info = match serde_bencode::from_bytes::<Value>(raw)? {
        Value::Dict(mut dict) => dict.remove(&b"info"[..]).ok_or(MetaInfoError::MissingInfo)?,
        _ => return Err(MetaInfoError::MissingInfo),
    };
    Ok(Sha1::digest(serde_bencode::to_bytes(&info)?).into())
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_ref().map(|u| u.as_str()))
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// Dont want to print out the pieces field, so we implement Debug manually.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .finish()
    }
}
