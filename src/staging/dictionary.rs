//! Closed, versioned interned-symbol dictionaries for the compact stage.
//!
//! A dictionary maps recurring structural tokens (schema tags, field names,
//! operation tags, category names) to one-byte symbol ids. Dictionaries are
//! immutable once built; a new token list means a new version.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::staging::StagingError;

/// Maximum number of tokens in one dictionary (symbol ids are one byte).
pub const MAX_TOKENS: usize = 256;

/// Minimum token length; a symbol is two bytes, so shorter tokens would not shrink.
pub const MIN_TOKEN_LEN: usize = 2;

/// Maximum token length (tokens are short-form strings in the symbolic stage).
pub const MAX_TOKEN_LEN: usize = 255;

/// Version of the built-in dictionary.
pub const BUILTIN_VERSION: u8 = 1;

/// Tokens of the built-in dictionary, in symbol-id order. Never reorder or
/// remove entries: that changes the meaning of already-stored payloads.
const BUILTIN_TOKENS: &[&str] = &[
    // Record envelope and common field names.
    "task", "query", "answer", "document", "event", "entity", "report", "name", "title",
    "priority", "status", "state", "type", "kind", "category", "operation", "source", "target",
    "owner", "assignee", "description", "summary", "tags", "labels", "timestamp", "created",
    "updated", "deadline", "id", "ref", "parent", "children", "items", "count", "total", "value",
    "values", "score", "confidence", "location", "region", "phase", "step", "steps", "result",
    "results", "error", "message", "schema", "fields", "depth", "fan_out", "tier", "size",
    // Categorical values.
    "low", "medium", "high", "critical", "open", "closed", "pending", "active", "done", "failed",
    "unknown", "true", "false",
    // Operation categories.
    "crud", "communication", "control", "network", "security", "resource", "coordination",
    // Operation primitives.
    "CREATE", "READ", "UPDATE", "DELETE", "SEND", "RECEIVE", "TRANSFORM", "VALIDATE", "BRANCH",
    "LOOP", "RETURN", "CALL", "CONNECT", "DISCONNECT", "ROUTE", "FILTER", "AUTHENTICATE",
    "AUTHORIZE", "ENCRYPT", "DECRYPT", "ALLOCATE", "DEALLOCATE", "LOCK", "UNLOCK", "SAVE",
    "RESTORE", "CHECKPOINT", "ROLLBACK", "COORDINATE", "SYNCHRONIZE", "SIGNAL", "WAIT",
    // Operational phases.
    "hunt", "detect", "disrupt", "disable", "dominate",
];

/// On-disk form of a dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DictionaryFile {
    pub version: u8,
    pub tokens: Vec<String>,
}

/// One immutable interned-symbol table.
#[derive(Debug, Clone)]
pub struct SymbolDictionary {
    version: u8,
    tokens: Vec<String>,
    index: HashMap<String, u8>,
}

impl SymbolDictionary {
    /// Build and validate a dictionary.
    pub fn new(version: u8, tokens: Vec<String>) -> Result<Self, StagingError> {
        if version == 0 {
            return Err(StagingError::InvalidDictionary {
                version,
                reason: "version 0 is reserved".to_string(),
            });
        }
        if tokens.len() > MAX_TOKENS {
            return Err(StagingError::InvalidDictionary {
                version,
                reason: format!("{} tokens exceeds the limit of {MAX_TOKENS}", tokens.len()),
            });
        }

        let mut index = HashMap::with_capacity(tokens.len());
        for (id, token) in tokens.iter().enumerate() {
            if !(MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&token.len()) {
                return Err(StagingError::InvalidDictionary {
                    version,
                    reason: format!(
                        "token {token:?} must be {MIN_TOKEN_LEN}..={MAX_TOKEN_LEN} bytes"
                    ),
                });
            }
            if index.insert(token.clone(), id as u8).is_some() {
                return Err(StagingError::InvalidDictionary {
                    version,
                    reason: format!("duplicate token {token:?}"),
                });
            }
        }

        Ok(Self {
            version,
            tokens,
            index,
        })
    }

    /// The built-in version 1 dictionary.
    pub fn builtin() -> Self {
        let tokens = BUILTIN_TOKENS.iter().map(|t| t.to_string()).collect();
        // The built-in table is a compile-time constant validated by tests.
        match Self::new(BUILTIN_VERSION, tokens) {
            Ok(dict) => dict,
            Err(e) => panic!("built-in dictionary is invalid: {e}"),
        }
    }

    /// Load a dictionary from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let file: DictionaryFile = serde_json::from_str(&data)?;
        Ok(Self::new(file.version, file.tokens)?)
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Symbol id for a token, if interned.
    pub fn symbol(&self, token: &str) -> Option<u8> {
        self.index.get(token).copied()
    }

    /// Token for a symbol id, if assigned.
    pub fn token(&self, symbol: u8) -> Option<&str> {
        self.tokens.get(symbol as usize).map(String::as_str)
    }
}

/// All dictionary versions known to a serializer. Encoding always uses the
/// newest version; decoding picks the version recorded in the payload.
#[derive(Debug, Clone)]
pub struct DictionarySet {
    versions: BTreeMap<u8, Arc<SymbolDictionary>>,
}

impl DictionarySet {
    /// A set holding only the built-in dictionary.
    pub fn builtin() -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(BUILTIN_VERSION, Arc::new(SymbolDictionary::builtin()));
        Self { versions }
    }

    /// Register an additional version. Re-registering an existing version is rejected.
    pub fn register(&mut self, dictionary: SymbolDictionary) -> Result<(), StagingError> {
        let version = dictionary.version();
        if self.versions.contains_key(&version) {
            return Err(StagingError::InvalidDictionary {
                version,
                reason: "version already registered".to_string(),
            });
        }
        self.versions.insert(version, Arc::new(dictionary));
        Ok(())
    }

    /// The dictionary used for new encodings.
    pub fn current(&self) -> &Arc<SymbolDictionary> {
        // Never empty: constructed with the built-in version.
        self.versions
            .values()
            .next_back()
            .unwrap_or_else(|| unreachable!("dictionary set is never empty"))
    }

    /// Look up a dictionary by version.
    pub fn get(&self, version: u8) -> Result<&Arc<SymbolDictionary>, StagingError> {
        self.versions
            .get(&version)
            .ok_or(StagingError::UnknownDictionary(version))
    }
}

impl Default for DictionarySet {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_is_valid() {
        let dict = SymbolDictionary::builtin();
        assert_eq!(dict.version(), BUILTIN_VERSION);
        assert!(dict.len() <= MAX_TOKENS);
        assert_eq!(dict.symbol("task"), Some(0));
        assert_eq!(dict.token(0), Some("task"));
        assert!(dict.symbol("Recon").is_none());
    }

    #[test]
    fn test_rejects_short_and_duplicate_tokens() {
        assert!(SymbolDictionary::new(2, vec!["a".into()]).is_err());
        assert!(SymbolDictionary::new(2, vec!["ab".into(), "ab".into()]).is_err());
        assert!(SymbolDictionary::new(0, vec!["ab".into()]).is_err());
    }

    #[test]
    fn test_set_prefers_newest_version() {
        let mut set = DictionarySet::builtin();
        set.register(SymbolDictionary::new(7, vec!["task".into(), "alpha".into()]).unwrap())
            .unwrap();
        assert_eq!(set.current().version(), 7);
        assert_eq!(set.get(1).unwrap().version(), 1);
        assert!(matches!(set.get(3), Err(StagingError::UnknownDictionary(3))));
    }
}
