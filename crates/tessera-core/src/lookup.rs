/// Outcome of an analysis lookup.
///
/// "Nothing at this position" is a normal outcome and is kept apart from genuine failures so
/// callers can answer it with an empty result instead of an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult<T> {
    Found(T),
    NotFound,
    Error(LookupError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// The request itself was malformed (bad position, unknown document, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The analysis could not complete.
    #[error("{0}")]
    Failed(String),
}

impl<T> LookupResult<T> {
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => LookupResult::Found(value),
            None => LookupResult::NotFound,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        LookupResult::Error(LookupError::Failed(message.into()))
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        LookupResult::Error(LookupError::InvalidInput(message.into()))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> LookupResult<U> {
        match self {
            LookupResult::Found(value) => LookupResult::Found(f(value)),
            LookupResult::NotFound => LookupResult::NotFound,
            LookupResult::Error(err) => LookupResult::Error(err),
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, LookupResult::Found(_))
    }

    /// Collapse into a `Result`, treating `NotFound` as `Ok(None)`.
    pub fn into_result(self) -> Result<Option<T>, LookupError> {
        match self {
            LookupResult::Found(value) => Ok(Some(value)),
            LookupResult::NotFound => Ok(None),
            LookupResult::Error(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_not_an_error() {
        let result: LookupResult<u32> = LookupResult::from_option(None);
        assert_eq!(result.into_result(), Ok(None));

        let result = LookupResult::Found(3).map(|v| v * 2);
        assert_eq!(result.into_result(), Ok(Some(6)));

        let result: LookupResult<u32> = LookupResult::invalid_input("line 99 out of range");
        assert_eq!(
            result.into_result(),
            Err(LookupError::InvalidInput("line 99 out of range".into()))
        );
    }

    #[test]
    fn errors_render_for_clients() {
        assert_eq!(
            LookupError::InvalidInput("no package for file".into()).to_string(),
            "invalid input: no package for file"
        );
        assert_eq!(LookupError::Failed("backend crashed".into()).to_string(), "backend crashed");
    }
}
