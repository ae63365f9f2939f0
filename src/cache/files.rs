// On-disk layout of the page and sub-resource caches.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, warn};

use super::digest;
use crate::error::SessionError;
use crate::source::traits::ResponseHeaders;

const HTML_EXT: &str = "html";
const TEMPLATE_EXT: &str = "tpl";
const DATA_EXT: &str = "data";
const HEADER_EXT: &str = "header";
const RESOURCE_EXT: &str = "res";

const HEADER_SEPARATOR: &str = " : ";
const HEADER_LINE_END: &str = "\r\n";

/// Paths of everything cached for one page or sub-resource.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    cache_dir: PathBuf,
    resource_dir: PathBuf,
}

impl CacheLayout {
    pub fn new(cache_dir: impl Into<PathBuf>, resource_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            resource_dir: resource_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn resource_dir(&self) -> &Path {
        &self.resource_dir
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.cache_dir, &self.resource_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                SessionError::MakeDir(format!("{}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// File name stem for a session id. Ids that are not safe as file names are hashed.
    pub fn session_stem(&self, session_id: &str) -> String {
        let safe = !session_id.is_empty()
            && session_id.len() <= 128
            && !session_id.starts_with('.')
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if safe {
            session_id.to_string()
        } else {
            digest::content_digest(session_id.as_bytes())
        }
    }

    fn session_file(&self, session_id: &str, ext: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{}", self.session_stem(session_id), ext))
    }

    pub fn html_path(&self, session_id: &str) -> PathBuf {
        self.session_file(session_id, HTML_EXT)
    }

    pub fn template_path(&self, session_id: &str) -> PathBuf {
        self.session_file(session_id, TEMPLATE_EXT)
    }

    pub fn data_path(&self, session_id: &str) -> PathBuf {
        self.session_file(session_id, DATA_EXT)
    }

    pub fn header_path(&self, session_id: &str) -> PathBuf {
        self.session_file(session_id, HEADER_EXT)
    }

    pub fn resource_path(&self, resource_id: &str) -> PathBuf {
        self.resource_dir
            .join(format!("{}.{}", resource_id, RESOURCE_EXT))
    }

    pub fn resource_header_path(&self, resource_id: &str) -> PathBuf {
        self.resource_dir
            .join(format!("{}.{}", resource_id, HEADER_EXT))
    }

    /// Write the artifacts of one page. A missing template keeps the one already on disk.
    /// Returns the size of the html file.
    pub fn save_session_files(
        &self,
        session_id: &str,
        html: &str,
        template: Option<&str>,
        data: &str,
        headers: &ResponseHeaders,
    ) -> Result<u64> {
        fs::create_dir_all(&self.cache_dir).map_err(|e| {
            SessionError::MakeDir(format!("{}: {}", self.cache_dir.display(), e))
        })?;

        let html_path = self.html_path(session_id);
        write_file(&html_path, html.as_bytes())?;
        if let Some(template) = template.filter(|t| !t.is_empty()) {
            write_file(&self.template_path(session_id), template.as_bytes())?;
        }
        write_file(&self.data_path(session_id), data.as_bytes())?;
        write_file(
            &self.header_path(session_id),
            headers_to_string(headers).as_bytes(),
        )?;

        let size = fs::metadata(&html_path)?.len();
        debug!("saved session files for {} ({} bytes)", session_id, size);
        Ok(size)
    }

    pub fn read_html(&self, session_id: &str) -> Option<String> {
        read_string(&self.html_path(session_id))
    }

    pub fn read_template(&self, session_id: &str) -> Option<String> {
        read_string(&self.template_path(session_id))
    }

    /// Cached data portion as JSON.
    pub fn read_data(&self, session_id: &str) -> Option<Value> {
        let raw = read_string(&self.data_path(session_id))?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("cached data for {} is not json: {}", session_id, e);
                None
            }
        }
    }

    pub fn read_headers(&self, session_id: &str) -> ResponseHeaders {
        read_string(&self.header_path(session_id))
            .map(|raw| parse_headers(&raw))
            .unwrap_or_default()
    }

    pub fn html_size(&self, session_id: &str) -> Option<u64> {
        fs::metadata(self.html_path(session_id)).ok().map(|m| m.len())
    }

    /// Delete the four artifacts of one page. True when nothing is left behind.
    pub fn delete_session_files(&self, session_id: &str) -> bool {
        [
            self.html_path(session_id),
            self.template_path(session_id),
            self.data_path(session_id),
            self.header_path(session_id),
        ]
        .iter()
        .fold(true, |ok, path| remove_if_exists(path) && ok)
    }

    /// Delete every cached page file.
    pub fn delete_all_session_files(&self) -> bool {
        delete_dir_children(&self.cache_dir)
    }

    pub fn save_resource_files(
        &self,
        resource_id: &str,
        content: &[u8],
        headers: &ResponseHeaders,
    ) -> Result<()> {
        fs::create_dir_all(&self.resource_dir).map_err(|e| {
            SessionError::MakeDir(format!("{}: {}", self.resource_dir.display(), e))
        })?;
        write_file(&self.resource_path(resource_id), content)?;
        write_file(
            &self.resource_header_path(resource_id),
            headers_to_string(headers).as_bytes(),
        )?;
        Ok(())
    }

    pub fn read_resource(&self, resource_id: &str) -> Option<Vec<u8>> {
        match fs::read(self.resource_path(resource_id)) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!("read resource {} failed: {}", resource_id, e);
                None
            }
        }
    }

    pub fn read_resource_headers(&self, resource_id: &str) -> ResponseHeaders {
        read_string(&self.resource_header_path(resource_id))
            .map(|raw| parse_headers(&raw))
            .unwrap_or_default()
    }

    pub fn resource_size(&self, resource_id: &str) -> Option<u64> {
        fs::metadata(self.resource_path(resource_id))
            .ok()
            .map(|m| m.len())
    }

    pub fn delete_resource_files(&self, resource_id: &str) -> bool {
        let content = remove_if_exists(&self.resource_path(resource_id));
        let headers = remove_if_exists(&self.resource_header_path(resource_id));
        content && headers
    }
}

/// Serialize headers one `name : value` line per value. Empty values are skipped.
pub fn headers_to_string(headers: &ResponseHeaders) -> String {
    let mut out = String::new();
    let mut names: Vec<_> = headers.iter().collect();
    names.sort_by(|a, b| a.0.cmp(b.0));
    for (name, values) in names {
        if name.is_empty() {
            continue;
        }
        for value in values.iter().filter(|v| !v.is_empty()) {
            out.push_str(name);
            out.push_str(HEADER_SEPARATOR);
            out.push_str(value);
            out.push_str(HEADER_LINE_END);
        }
    }
    out
}

/// Parse what [`headers_to_string`] wrote. Lines without exactly one separator are ignored.
pub fn parse_headers(raw: &str) -> ResponseHeaders {
    let mut headers = ResponseHeaders::new();
    for line in raw.split(HEADER_LINE_END) {
        let parts: Vec<&str> = line.split(HEADER_SEPARATOR).collect();
        if parts.len() == 2 {
            let name = parts[0].trim();
            if !name.is_empty() {
                headers.append(name, parts[1].trim());
            }
        }
    }
    headers
}

/// Total size of the files directly under `dir`, grouped by file stem.
pub fn scan_dir(dir: &Path) -> (u64, HashMap<String, Vec<PathBuf>>) {
    let mut total = 0u64;
    let mut by_stem: HashMap<String, Vec<PathBuf>> = HashMap::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return (0, by_stem);
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        total += meta.len();
        let stem = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.split('.').next().unwrap_or(n).to_string())
            .unwrap_or_default();
        by_stem.entry(stem).or_default().push(path);
    }
    (total, by_stem)
}

fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    fs::write(path, content)
        .map_err(|e| SessionError::WriteFile(format!("{}: {}", path.display(), e)))?;
    Ok(())
}

fn read_string(path: &Path) -> Option<String> {
    match fs::read(path) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            warn!("read {} failed: {}", path.display(), e);
            None
        }
    }
}

fn remove_if_exists(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => true,
        Err(e) => {
            warn!("delete {} failed: {}", path.display(), e);
            false
        }
    }
}

fn delete_dir_children(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return true;
    };
    let mut ok = true;
    for entry in entries.flatten() {
        let path = entry.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = removed {
            warn!("delete {} failed: {}", path.display(), e);
            ok = false;
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_stem_hashes_unsafe_ids() {
        let layout = CacheLayout::new("/tmp/a", "/tmp/b");
        assert_eq!(layout.session_stem("home_page-1"), "home_page-1");
        let hashed = layout.session_stem("https://example.com/a?b=c");
        assert_eq!(hashed.len(), 64);
        assert_eq!(layout.session_stem("../etc"), digest::content_digest(b"../etc"));
    }

    #[test]
    fn test_header_round_trip_skips_empty_and_malformed() {
        let mut headers = ResponseHeaders::new();
        headers.append("ETag", "abc");
        headers.append("Set-Cookie", "a=1");
        headers.append("Set-Cookie", "b=2");
        headers.append("Cache-Offline", "");

        let raw = headers_to_string(&headers);
        assert!(raw.contains("etag : abc\r\n"));
        assert!(!raw.contains("cache-offline"));

        let parsed = parse_headers(&format!("{}garbage line\r\nx : y : z\r\n", raw));
        assert_eq!(parsed.get("etag"), Some("abc"));
        assert_eq!(parsed.get_all("set-cookie"), ["a=1", "b=2"]);
        assert!(!parsed.contains("x"));
        assert!(!parsed.contains("cache-offline"));
    }

    #[test]
    fn test_parse_headers_lowercases_names() {
        let parsed = parse_headers("Content-Type : text/html; charset=gbk\r\n");
        assert_eq!(parsed.get("content-type"), Some("text/html; charset=gbk"));
    }

    #[test]
    fn test_save_read_delete_session_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path().join("pages"), dir.path().join("res"));
        let mut headers = ResponseHeaders::new();
        headers.append("etag", "e1");

        let size = layout
            .save_session_files("s1", "<html>1</html>", Some("<html>{d}</html>"), r#"{"d":1}"#, &headers)
            .unwrap();
        assert_eq!(size, 14);
        assert_eq!(layout.read_html("s1").as_deref(), Some("<html>1</html>"));
        assert_eq!(layout.read_data("s1"), Some(serde_json::json!({"d": 1})));
        assert_eq!(layout.read_headers("s1").get("etag"), Some("e1"));

        // A data-only save keeps the previous template.
        layout
            .save_session_files("s1", "<html>2</html>", None, r#"{"d":2}"#, &headers)
            .unwrap();
        assert_eq!(layout.read_template("s1").as_deref(), Some("<html>{d}</html>"));

        assert!(layout.delete_session_files("s1"));
        assert!(layout.read_html("s1").is_none());
        assert!(layout.read_template("s1").is_none());
    }

    #[test]
    fn test_scan_dir_groups_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.html"), b"12345").unwrap();
        fs::write(dir.path().join("a.header"), b"12").unwrap();
        fs::write(dir.path().join("b.html"), b"1").unwrap();

        let (total, by_stem) = scan_dir(dir.path());
        assert_eq!(total, 8);
        assert_eq!(by_stem["a"].len(), 2);
        assert_eq!(by_stem["b"].len(), 1);
    }
}
