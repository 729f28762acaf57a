//! Publishes assembled objects to the content store.

use std::sync::Arc;

use imgstash_protocol::types::PublishedLinks;
use tracing::info;

use crate::assembler::AssembledObject;
use crate::content::{ContentStore, VersionToken};
use crate::error::{SessionError, StoreError};

/// A successfully published image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedImage {
    pub path: String,
    pub version: VersionToken,
    pub size: u64,
    pub mime_type: String,
    pub links: PublishedLinks,
}

/// Writes assembled buffers to a [`ContentStore`], never overwriting.
pub struct ContentPublisher {
    content: Arc<dyn ContentStore>,
    base_url: String,
}

impl ContentPublisher {
    /// `base_url` is the public prefix under which stored paths are served.
    pub fn new(content: Arc<dyn ContentStore>, base_url: &str) -> Self {
        Self {
            content,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn content_store(&self) -> &dyn ContentStore {
        self.content.as_ref()
    }

    /// Stores `object` under its file name.
    ///
    /// An existing object at that path is a [`SessionError::Conflict`];
    /// the caller must rename and resubmit.
    pub async fn publish(&self, object: AssembledObject) -> Result<PublishedImage, SessionError> {
        let path = object.file_name.clone();
        if self.content.exists(&path).await? {
            return Err(SessionError::Conflict(path));
        }

        let size = object.data.len() as u64;
        let version = match self.content.create(&path, object.data).await {
            Ok(v) => v,
            // Lost a race with another publisher.
            Err(StoreError::AlreadyExists(p)) => return Err(SessionError::Conflict(p)),
            Err(e) => return Err(e.into()),
        };

        info!(path = %path, size, version = %version, "image published");
        Ok(PublishedImage {
            links: self.links_for(&path),
            path,
            version,
            size,
            mime_type: object.mime_type,
        })
    }

    /// Embeddable links for a stored path.
    pub fn links_for(&self, path: &str) -> PublishedLinks {
        let url = format!("{}/{}", self.base_url, encode_path_segment(path));
        PublishedLinks {
            markdown: format!("![{path}]({url})"),
            html: format!("<img src=\"{url}\" alt=\"{}\">", escape_html(path)),
            bbcode: format!("[img]{url}[/img]"),
            url,
        }
    }
}

/// Percent-encodes everything outside the RFC 3986 unreserved set.
fn encode_path_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
