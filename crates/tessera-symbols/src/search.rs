use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tessera_cache::{CacheError, Namespace, SingleFlightCache};
use tessera_scheduler::{for_each_bounded, TaskError};
use tokio_util::sync::CancellationToken;

use crate::{score, PackageId, Query, SearchError, Symbol, SymbolInformation, SymbolSource};

/// Result count used when the caller passes a limit of 0.
pub const DEFAULT_LIMIT: usize = 100;

/// Cache key for one package's symbols: the content fingerprint is part of the key, so a changed
/// package misses and is re-enumerated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageKey {
    pub package: PackageId,
    pub fingerprint: u64,
}

pub type PackageSymbolCache = SingleFlightCache<PackageKey, Arc<Vec<Symbol>>>;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub workers: usize,
    pub default_limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            default_limit: DEFAULT_LIMIT,
        }
    }
}

#[derive(Debug)]
struct Scored {
    score: u32,
    symbol: Symbol,
}

fn rank(a: &Scored, b: &Scored) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| a.symbol.container.cmp(&b.symbol.container))
        .then_with(|| a.symbol.name.cmp(&b.symbol.name))
        .then_with(|| a.symbol.location.cmp(&b.symbol.location))
        .then_with(|| (a.symbol.kind as u8).cmp(&(b.symbol.kind as u8)))
}

/// Ranked `workspace/symbol` search over a [`SymbolSource`].
pub struct WorkspaceSymbolSearch<S> {
    source: Arc<S>,
    cache: Arc<PackageSymbolCache>,
    namespace: Arc<Namespace>,
    options: SearchOptions,
}

impl<S> Clone for WorkspaceSymbolSearch<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            cache: self.cache.clone(),
            namespace: self.namespace.clone(),
            options: self.options.clone(),
        }
    }
}

impl<S: SymbolSource> WorkspaceSymbolSearch<S> {
    pub fn new(
        source: Arc<S>,
        cache: Arc<PackageSymbolCache>,
        namespace: Arc<Namespace>,
        options: SearchOptions,
    ) -> Self {
        Self {
            source,
            cache,
            namespace,
            options,
        }
    }

    /// Search every package and return at most `limit` results (0 selects the default limit).
    ///
    /// Packages that fail to enumerate are logged and skipped; the search still answers with
    /// what the others produced.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<Vec<SymbolInformation>, SearchError> {
        let query = Arc::new(Query::parse(query));
        let limit = if limit == 0 {
            self.options.default_limit
        } else {
            limit
        };

        let packages = self
            .source
            .packages()
            .await
            .map_err(|err| SearchError::Packages(format!("{err:#}")))?;

        let collected: Arc<Mutex<Vec<Scored>>> = Arc::new(Mutex::new(Vec::new()));
        let this = self.clone();
        let sink = collected.clone();
        let worker_token = token.clone();
        for_each_bounded(packages, self.options.workers, token, move |package| {
            let this = this.clone();
            let query = query.clone();
            let sink = sink.clone();
            let token = worker_token.clone();
            async move {
                let symbols = match this.package_symbols(&package, &token).await {
                    Ok(symbols) => symbols,
                    Err(CacheError::Cancelled) => return,
                    Err(err) => {
                        tracing::warn!(target: "tessera.symbols", package = %package, error = %err, "skipping package");
                        return;
                    }
                };
                let scored: Vec<Scored> = symbols
                    .iter()
                    .filter_map(|symbol| {
                        let score = score(&query, symbol);
                        (score > 0).then(|| Scored {
                            score,
                            symbol: symbol.clone(),
                        })
                    })
                    .collect();
                sink.lock().extend(scored);
            }
        })
        .await
        .map_err(|err| match err {
            TaskError::Cancelled => SearchError::Cancelled,
            TaskError::Panicked(message) => SearchError::Panicked(message),
        })?;

        let mut results = std::mem::take(&mut *collected.lock());
        results.sort_by(rank);
        results.truncate(limit);
        Ok(results
            .iter()
            .map(|scored| SymbolInformation::from(&scored.symbol))
            .collect())
    }

    /// Enumerate every package into the cache. Returns the number of packages warmed.
    pub async fn warm(&self, token: &CancellationToken) -> Result<usize, SearchError> {
        let packages = self
            .source
            .packages()
            .await
            .map_err(|err| SearchError::Packages(format!("{err:#}")))?;
        let count = packages.len();

        let this = self.clone();
        let worker_token = token.clone();
        for_each_bounded(packages, self.options.workers, token, move |package| {
            let this = this.clone();
            let token = worker_token.clone();
            async move {
                if let Err(err) = this.package_symbols(&package, &token).await {
                    tracing::debug!(target: "tessera.symbols", package = %package, error = %err, "warm-up skipped package");
                }
            }
        })
        .await
        .map_err(|err| match err {
            TaskError::Cancelled => SearchError::Cancelled,
            TaskError::Panicked(message) => SearchError::Panicked(message),
        })?;
        Ok(count)
    }

    async fn package_symbols(
        &self,
        package: &PackageId,
        token: &CancellationToken,
    ) -> Result<Arc<Vec<Symbol>>, CacheError> {
        let fingerprint = self
            .source
            .fingerprint(package)
            .await
            .map_err(|err| CacheError::Failed(format!("{err:#}")))?;
        let key = PackageKey {
            package: package.clone(),
            fingerprint,
        };

        let source = self.source.clone();
        let package = package.clone();
        self.cache
            .get_cancellable(&self.namespace, key, token, move || async move {
                tracing::debug!(target: "tessera.symbols", package = %package, "enumerating package symbols");
                source
                    .symbols(&package)
                    .await
                    .map(Arc::new)
                    .map_err(|err| format!("{err:#}"))
            })
            .await
    }
}
