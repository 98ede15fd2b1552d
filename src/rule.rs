//! Rule identity and dependency records.
//!
//! A rule is identified by its name and positional arguments. Every rule
//! invocation accumulates the set of inputs it observed: file contents,
//! ambient facts (environment variables, compiler identities) and the
//! results of sub-rules. The digest of that set keys the memo store.

use crate::{error::Result, hash::ContentHash};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

/// Identity of a rule invocation: `(rule-name, positional-args)`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct RuleId {
    pub name: String,
    pub args: Vec<String>,
}

impl RuleId {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self { name: name.into(), args }
    }

    /// Stable key for this rule instance, used as the memo table key and the
    /// artifact directory name: `compile-1f0a92bc`.
    pub fn instance_key(&self) -> String {
        if self.args.is_empty() {
            self.name.clone()
        } else {
            let hash = ContentHash::of_fields(&self.args);
            format!("{}-{}", self.name, hash.short())
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.args.join(", "))
    }
}

/// One observed input of a rule invocation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DepItem {
    /// A file path and the digest of its bytes; `None` if the file is absent.
    File { path: PathBuf, hash: Option<ContentHash> },
    /// An opaque `(key, value)` pair capturing ambient inputs.
    Fact { key: String, value: serde_json::Value },
    /// The identity and result digest of a sub-rule.
    Rule { id: RuleId, hash: ContentHash },
}

/// A file dependency observed during the execute phase, revalidated in
/// recorded order on later lookups.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileDep {
    pub path: PathBuf,
    pub hash: Option<ContentHash>,
}

impl FileDep {
    /// Hash the file's current contents.
    pub fn observe(path: PathBuf) -> Result<Self> {
        let hash = ContentHash::of_file(&path)?;
        Ok(Self { path, hash })
    }

    /// Whether the file on disk still matches the recorded observation.
    pub fn still_valid(&self) -> bool {
        matches!(ContentHash::of_file(&self.path), Ok(ref current) if *current == self.hash)
    }
}

/// The append-only dependency set of one rule invocation.
#[derive(Clone, Debug, Default)]
pub struct DepRecord {
    items: Vec<DepItem>,
}

impl DepRecord {
    pub fn push_file(&mut self, path: PathBuf) -> Result<()> {
        let hash = ContentHash::of_file(&path)?;
        self.items.push(DepItem::File { path, hash });
        Ok(())
    }

    pub fn push_fact(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.items.push(DepItem::Fact { key: key.into(), value });
    }

    pub fn push_rule(&mut self, id: RuleId, hash: ContentHash) {
        self.items.push(DepItem::Rule { id, hash });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[DepItem] {
        &self.items
    }

    /// Digest of the dependency *set*.
    ///
    /// Items are serialized individually, then sorted and deduplicated, so
    /// the digest is independent of the completion order of concurrent
    /// sub-rules within the probe.
    pub fn digest(&self) -> ContentHash {
        let mut encoded: Vec<String> = self
            .items
            .iter()
            .map(|item| serde_json::to_string(item).expect("dep items serialize"))
            .collect();
        encoded.sort_unstable();
        encoded.dedup();
        ContentHash::of_fields(encoded)
    }
}
