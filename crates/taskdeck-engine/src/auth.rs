use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

/// Shared bearer-token slot. Clones observe the same token.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    slot: Arc<RwLock<Option<String>>>,
}

impl AuthContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let ctx = Self::default();
        ctx.set_token(token);
        ctx
    }

    /// Loads a persisted token. A missing file is an unauthenticated context,
    /// not an error.
    pub fn from_token_file(path: &Path) -> io::Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Self::with_token(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err),
        }
    }

    pub fn get_token(&self) -> Option<String> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        let token = token.into();
        let token = token.trim();
        let value = if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        };
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn clear(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.get_token().is_some()
    }

    pub fn bearer_header(&self) -> Option<String> {
        self.get_token().map(|token| format!("Bearer {token}"))
    }
}
