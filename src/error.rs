// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur in the hash-tree engine
#[derive(Debug)]
pub enum Error {
    /// I/O error surfaced by the digest store or the user store
    Io(std::io::Error),

    /// The digest store or user store reported a failure that isn't an I/O error
    /// (e.g. a backend-specific storage fault)
    Store(String),

    /// A remote peer failed to answer during `synch`; the sync is aborted and no
    /// local state is changed
    Remote(String),

    /// Invalid configuration or other programmer misuse, caught at construction or
    /// on first use
    Config(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "HashTreeError::Io({e})"),
            Self::Store(msg) => write!(f, "HashTreeError::Store({msg})"),
            Self::Remote(msg) => write!(f, "HashTreeError::Remote({msg})"),
            Self::Config(msg) => write!(f, "HashTreeError::Config({msg})"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Hash-tree result
pub type Result<T> = std::result::Result<T, Error>;
