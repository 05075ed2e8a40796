use serde::{de, ser, Deserialize};
use url::Url;

// Serde helpers for metainfo and tracker models.

pub fn opt_url_deserialize<'de, D>(deserializer: D) -> Result<Option<Url>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        return Ok(None);
    }
    Url::parse(&s).map(Some).map_err(de::Error::custom)
}

pub fn opt_url_serialize<S>(url: &Option<Url>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: ser::Serializer,
{
    match url {
        Some(url) => serializer.serialize_str(url.as_str()),
        None => serializer.serialize_none(),
    }
}
