//! Client configuration options.

/// Options for configuring the emberkv client connection.
///
/// # Example
///
/// ```rust
/// use emberkv_client::EmberKvClientOptions;
///
/// let options = EmberKvClientOptions::new("http://localhost:9980");
/// ```
#[derive(Clone, Debug)]
pub struct EmberKvClientOptions {
    /// The server URL (e.g., "http://localhost:9980")
    pub url: String,
}

impl EmberKvClientOptions {
    /// Create new options with the given server URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Create options from environment variables.
    ///
    /// Reads `EMBERKV_SERVER_URL` (defaults to "http://127.0.0.1:9980").
    pub fn from_env() -> Self {
        let url = std::env::var("EMBERKV_SERVER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:9980".to_string());
        Self { url }
    }
}

impl Default for EmberKvClientOptions {
    fn default() -> Self {
        Self::new("http://127.0.0.1:9980")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_points_at_localhost() {
        assert_eq!(
            EmberKvClientOptions::default().url,
            "http://127.0.0.1:9980"
        );
    }
}
