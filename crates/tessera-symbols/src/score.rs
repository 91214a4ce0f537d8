use crate::{Query, Symbol};

/// Relevance of `symbol` for `query`; 0 means "exclude".
pub fn score(query: &Query, symbol: &Symbol) -> u32 {
    if let Some(kind) = query.kind {
        if !symbol.kind.satisfies(kind) {
            return 0;
        }
    }
    let vendored = symbol.is_vendored();
    if vendored && query.exported_only {
        return 0;
    }
    if query.has_scope() && !query.in_scope(&symbol.path) {
        return 0;
    }

    if query.tokens.is_empty() {
        return if vendored { 1 } else { 2 };
    }

    let name = symbol.name.to_lowercase();
    let container = symbol.container.to_lowercase();
    let path = symbol.path.to_lowercase();
    let basename = path.rsplit('/').next().unwrap_or(&path);

    let mut score = 0;
    let last = query.tokens.len() - 1;
    for (i, token) in query.tokens.iter().enumerate() {
        let token = token.as_str();
        if container.starts_with(token) {
            score += 2;
        }
        if name.starts_with(token) {
            score += 3;
        }
        if token.len() >= 3 {
            if path.contains(token) {
                score += 1;
            }
            if basename.starts_with(token) {
                score += 2;
            }
        }
        if token == name {
            score += if i == last { 50 } else { 5 };
        }
        if token == container {
            score += 3;
        }
    }

    if score > 0 {
        if !vendored {
            score += 5;
        }
        if symbol.exported {
            score += 1;
        }
    }
    if query.exported_only && !symbol.exported {
        return 0;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    use tessera_core::{Location, Range};

    use crate::SymbolKind;

    fn symbol(container: &str, name: &str, path: &str, exported: bool) -> Symbol {
        Symbol {
            name: name.to_string(),
            kind: SymbolKind::Function,
            container: container.to_string(),
            path: path.to_string(),
            location: Location {
                uri: format!("file:///ws/{path}"),
                range: Range::default(),
            },
            exported,
        }
    }

    #[test]
    fn exact_last_token_dominates() {
        let query = Query::parse("foo bar");
        assert_eq!(score(&query, &symbol("foo", "bar", "foo/bar.go", false)), 67);
        assert_eq!(score(&query, &symbol("asdf", "foo", "asdf/asdf.go", false)), 13);
        assert_eq!(score(&query, &symbol("asdf", "asdf", "foo/asdf.go", false)), 6);
        assert_eq!(score(&query, &symbol("one", "two", "one/two.go", false)), 0);
    }

    #[test]
    fn exported_bonus_and_filter() {
        let exported = symbol("http", "Get", "net/http/client.go", true);
        let private = symbol("http", "get", "net/http/client.go", false);

        let query = Query::parse("get");
        assert_eq!(score(&query, &exported), score(&query, &private) + 1);

        let query = Query::parse("is:exported get");
        assert!(score(&query, &exported) > 0);
        assert_eq!(score(&query, &private), 0);
    }

    #[test]
    fn vendored_symbols_rank_lower_or_drop_out() {
        let local = symbol("x", "Run", "cmd/run.go", true);
        let vendored = symbol("x", "Run", "vendor/x/run.go", true);

        assert_eq!(score(&Query::parse(""), &local), 2);
        assert_eq!(score(&Query::parse(""), &vendored), 1);
        assert_eq!(score(&Query::parse("run"), &local), score(&Query::parse("run"), &vendored) + 5);
        assert_eq!(score(&Query::parse("is:exported run"), &vendored), 0);
    }

    #[test]
    fn kind_and_scope_filters_exclude() {
        let sym = symbol("pkg", "Open", "pkg/file.go", true);
        assert_eq!(score(&Query::parse("kind:var open"), &sym), 0);
        assert_eq!(score(&Query::parse("dir:other open"), &sym), 0);
        assert!(score(&Query::parse("dir:pkg open"), &sym) > 0);
        assert!(score(&Query::parse("file:pkg/file.go"), &sym) > 0);
    }
}
