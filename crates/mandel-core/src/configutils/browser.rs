//! Browser data handed to the container at startup.

use crate::error::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// File in the unpacked config directory the browser imports on first start.
pub const BROWSER_DATA_FILENAME: &str = "user-initial-browser-data.json";

/// Manifest of extension ids imported in earlier sessions.
pub const SAVED_EXTENSIONS_FILENAME: &str = "imported-extensions.txt";

/// One bookmark node in Chromium's bookmark tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Bookmark>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub date_added: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub date_modified: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub guid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta_info: BTreeMap<String, String>,
}

/// A Chromium bookmarks file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmarks {
    #[serde(default)]
    pub roots: BTreeMap<String, Bookmark>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl Bookmarks {
    /// Whether there is nothing to import.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Accepts a bookmarks object, `null`, `""`, or a string holding bookmarks
/// JSON.
pub fn deserialize_bookmarks<'de, D>(deserializer: D) -> std::result::Result<Option<Bookmarks>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Tree(Bookmarks),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Raw::Text(s)) => serde_json::from_str(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(Raw::Tree(b)) if b.is_empty() => Ok(None),
        Some(Raw::Tree(b)) => Ok(Some(b)),
    }
}

fn bookmarks_absent(b: &Option<Bookmarks>) -> bool {
    b.as_ref().map_or(true, Bookmarks::is_empty)
}

/// Everything the client asked to import into the browser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserData {
    /// Cookies as a JSON string.
    #[serde(rename = "cookiesJSON", default, skip_serializing_if = "String::is_empty")]
    pub cookies_json: String,
    /// Bookmark tree.
    #[serde(
        default,
        deserialize_with = "deserialize_bookmarks",
        skip_serializing_if = "bookmarks_absent"
    )]
    pub bookmarks: Option<Bookmarks>,
    /// Comma separated extension ids.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extensions: String,
    /// Browser preferences as a JSON string.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preferences: String,
}

/// Write `data` as a single JSON blob into `config_dir`.
pub fn write_browser_data(config_dir: &Path, data: &BrowserData) -> Result<()> {
    std::fs::create_dir_all(config_dir)?;
    let json = serde_json::to_vec(data)?;
    std::fs::write(config_dir.join(BROWSER_DATA_FILENAME), json)?;
    Ok(())
}

fn split_ids(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Extension ids saved by earlier sessions. A missing manifest means none.
pub fn saved_extensions(config_dir: &Path) -> Result<Vec<String>> {
    match std::fs::read_to_string(config_dir.join(SAVED_EXTENSIONS_FILENAME)) {
        Ok(contents) => Ok(split_ids(&contents).map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Append `new` ids after `saved`, dropping duplicates and keeping order.
pub fn merge_extensions(saved: &[String], new: &str) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(saved.len());
    for id in saved.iter().map(String::as_str).chain(split_ids(new)) {
        if !merged.iter().any(|m| m == id) {
            merged.push(id.to_string());
        }
    }
    merged
}

/// Merge `new` into the saved manifest, rewrite it, and return the merged
/// comma separated list.
pub fn update_saved_extensions(config_dir: &Path, new: &str) -> Result<String> {
    let merged = merge_extensions(&saved_extensions(config_dir)?, new).join(",");
    std::fs::create_dir_all(config_dir)?;
    std::fs::write(config_dir.join(SAVED_EXTENSIONS_FILENAME), &merged)?;
    Ok(merged)
}
