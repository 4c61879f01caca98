use std::fmt;

/// A content address for one embedding: a blake3 digest of the model name
/// and the exact input text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Full lowercase hex digest, used as the on-disk file name.
    pub hex: String,
}

impl CacheKey {
    /// Derive the key for embedding `text` with `model`.
    ///
    /// The two parts are separated by a NUL byte so `("ab", "c")` and
    /// `("a", "bc")` never collide.
    ///
    /// # Examples
    ///
    /// ```
    /// use docrag::cache_key::CacheKey;
    ///
    /// let a = CacheKey::new("hash-384", "hello");
    /// assert_eq!(a, CacheKey::new("hash-384", "hello"));
    /// assert_ne!(a, CacheKey::new("other-model", "hello"));
    /// assert_eq!(a.hex.len(), 64);
    /// ```
    pub fn new(model: &str, text: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(model.as_bytes());
        hasher.update(&[0]);
        hasher.update(text.as_bytes());
        Self {
            hex: hasher.finalize().to_hex().to_string(),
        }
    }

    /// Short prefix for human display.
    pub fn short(&self) -> &str {
        &self.hex[..12]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.short())
    }
}
