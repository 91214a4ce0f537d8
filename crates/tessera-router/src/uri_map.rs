use std::path::{Path, PathBuf};

use serde_json::Value;
use tessera_core::uri::{rebase_file_uri, rebase_path};
use tessera_jsonrpc::Message;

/// Rewrites `file://` locations from one root directory to another.
///
/// Only `uri`, `rootUri` and `rootPath` fields are touched, at any depth. Locations outside the
/// source root and non-`file` schemes are left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriMapper {
    from: PathBuf,
    to: PathBuf,
}

impl UriMapper {
    pub fn new(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// The mapper for the opposite direction.
    pub fn inverse(&self) -> Self {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
        }
    }

    pub fn from_root(&self) -> &Path {
        &self.from
    }

    pub fn to_root(&self) -> &Path {
        &self.to
    }

    pub fn map_uri(&self, uri: &str) -> Option<String> {
        rebase_file_uri(uri, &self.from, &self.to)
    }

    pub fn map_path(&self, path: &str) -> Option<String> {
        rebase_path(Path::new(path), &self.from, &self.to)
            .map(|path| path.to_string_lossy().into_owned())
    }

    /// Rewrite every mappable field in `value`, returning how many were changed.
    pub fn rewrite(&self, value: &mut Value) -> usize {
        match value {
            Value::Object(map) => {
                let mut rewritten = 0;
                for (key, field) in map.iter_mut() {
                    let replacement = match (key.as_str(), &*field) {
                        ("uri" | "rootUri", Value::String(uri)) => self.map_uri(uri),
                        ("rootPath", Value::String(path)) => self.map_path(path),
                        _ => None,
                    };
                    match replacement {
                        Some(mapped) => {
                            *field = Value::String(mapped);
                            rewritten += 1;
                        }
                        None => rewritten += self.rewrite(field),
                    }
                }
                rewritten
            }
            Value::Array(items) => items.iter_mut().map(|item| self.rewrite(item)).sum(),
            _ => 0,
        }
    }

    /// Rewrite the payload of a whole message: params, results and error data.
    pub fn rewrite_message(&self, message: &mut Message) -> usize {
        match message {
            Message::Request(req) => self.rewrite(&mut req.params),
            Message::Notification(not) => self.rewrite(&mut not.params),
            Message::Response(resp) => match &mut resp.result {
                Ok(result) => self.rewrite(result),
                Err(err) => err.data.as_mut().map_or(0, |data| self.rewrite(data)),
            },
        }
    }
}
