//! Workspace symbol search.
//!
//! A query is parsed into filters and lowercased tokens ([`Query`]), every symbol of every
//! package is scored against it ([`score`]), and the survivors are ranked deterministically.
//! Package enumeration goes through a [`SymbolSource`]; results are cached per package and
//! content fingerprint, so unchanged packages are never re-scanned.

mod query;
mod score;
mod search;
mod source;

use serde::{Deserialize, Serialize};
use tessera_core::Location;

pub use query::Query;
pub use score::score;
pub use search::{PackageKey, PackageSymbolCache, SearchOptions, WorkspaceSymbolSearch, DEFAULT_LIMIT};
pub use source::{PackageId, SymbolSource};

/// Protocol symbol kinds, serialized as their numeric wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum SymbolKind {
    File = 1,
    Module = 2,
    Namespace = 3,
    Package = 4,
    Class = 5,
    Method = 6,
    Property = 7,
    Field = 8,
    Constructor = 9,
    Enum = 10,
    Interface = 11,
    Function = 12,
    Variable = 13,
    Constant = 14,
    Struct = 23,
}

impl SymbolKind {
    /// Parse a query keyword such as `func` or `class`.
    pub fn from_keyword(word: &str) -> Option<Self> {
        Some(match word {
            "package" => SymbolKind::Package,
            "type" | "class" => SymbolKind::Class,
            "func" | "function" | "method" => SymbolKind::Function,
            "var" | "variable" => SymbolKind::Variable,
            "const" | "constant" => SymbolKind::Constant,
            "field" => SymbolKind::Field,
            "interface" => SymbolKind::Interface,
            "module" => SymbolKind::Module,
            _ => return None,
        })
    }

    /// Whether a symbol of kind `self` satisfies the kind filter `filter`.
    ///
    /// Keywords name families: `func` also selects methods and `type` also selects structs.
    pub fn satisfies(self, filter: SymbolKind) -> bool {
        match filter {
            SymbolKind::Function => matches!(self, SymbolKind::Function | SymbolKind::Method),
            SymbolKind::Class => matches!(self, SymbolKind::Class | SymbolKind::Struct),
            other => self == other,
        }
    }
}

impl From<SymbolKind> for u8 {
    fn from(kind: SymbolKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for SymbolKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use SymbolKind::*;
        Ok(match value {
            1 => File,
            2 => Module,
            3 => Namespace,
            4 => Package,
            5 => Class,
            6 => Method,
            7 => Property,
            8 => Field,
            9 => Constructor,
            10 => Enum,
            11 => Interface,
            12 => Function,
            13 => Variable,
            14 => Constant,
            23 => Struct,
            other => return Err(format!("unsupported symbol kind {other}")),
        })
    }
}

/// A symbol as enumerated from a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// Enclosing package or type, empty at top level.
    pub container: String,
    /// Workspace-relative, `/`-separated path of the defining file.
    pub path: String,
    pub location: Location,
    pub exported: bool,
}

impl Symbol {
    pub fn is_vendored(&self) -> bool {
        tessera_core::is_vendored_path(&self.path)
    }
}

/// The `workspace/symbol` result shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInformation {
    pub name: String,
    pub kind: SymbolKind,
    pub location: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
}

impl From<&Symbol> for SymbolInformation {
    fn from(symbol: &Symbol) -> Self {
        Self {
            name: symbol.name.clone(),
            kind: symbol.kind,
            location: symbol.location.clone(),
            container_name: (!symbol.container.is_empty()).then(|| symbol.container.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SearchError {
    #[error("symbol search cancelled")]
    Cancelled,
    #[error("failed to list packages: {0}")]
    Packages(String),
    #[error("symbol search worker panicked: {0}")]
    Panicked(String),
}
