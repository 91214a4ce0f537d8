use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Symbol;

/// Identifies one package (typically a directory) of the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId(pub Arc<str>);

impl PackageId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where symbols come from: usually an analysis backend.
#[async_trait]
pub trait SymbolSource: Send + Sync + 'static {
    /// Every package of the workspace.
    async fn packages(&self) -> anyhow::Result<Vec<PackageId>>;

    /// A value that changes whenever the package's content changes.
    async fn fingerprint(&self, package: &PackageId) -> anyhow::Result<u64>;

    /// Enumerate the symbols defined in `package`. This is the expensive call.
    async fn symbols(&self, package: &PackageId) -> anyhow::Result<Vec<Symbol>>;
}
