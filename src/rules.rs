//! Named rule sets: a directory of `*.rules` grammar files compiled up
//! front and dispatched by name.
//!
//! Each file's stem becomes the rule name, so `ipv4.rules` is addressed as
//! `"ipv4"`. Compilation happens once at load; the set is immutable
//! afterwards and safe to share across threads.

use crate::codec::{Codec, CodecError};
use crate::parser::GrammarError;
use crate::value::{ResultNode, Value};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum RuleSetError {
    #[error("IO on `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("rule `{rule}`: {source}")]
    Grammar {
        rule: String,
        #[source]
        source: GrammarError,
    },
    #[error("unknown rule `{0}`")]
    UnknownRule(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A compiled collection of named grammars.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: HashMap<String, Codec>,
}

impl RuleSet {
    pub fn new() -> RuleSet {
        RuleSet::default()
    }

    /// Loads and compiles every `*.rules` file directly under `dir`.
    /// Non-matching entries and subdirectories are ignored.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<RuleSet, RuleSetError> {
        let dir = dir.as_ref();
        let mut set = RuleSet::new();
        let entries = std::fs::read_dir(dir).map_err(|e| RuleSetError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| RuleSetError::Io {
                path: dir.display().to_string(),
                source: e,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("rules") {
                continue;
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(s) => s.to_string(),
                None => continue,
            };
            let source = std::fs::read_to_string(&path).map_err(|e| RuleSetError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            set.insert_source(&name, &source)
                .map_err(|e| RuleSetError::Grammar { rule: name.clone(), source: e })?;
        }
        Ok(set)
    }

    /// Compiles one grammar source under a rule name. Replaces any rule
    /// already registered under that name.
    pub fn insert_source(&mut self, name: &str, source: &str) -> Result<(), GrammarError> {
        let codec = Codec::from_source(source)?;
        self.rules.insert(name.to_string(), codec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Codec> {
        self.rules.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    fn rule(&self, name: &str) -> Result<&Codec, RuleSetError> {
        self.rules
            .get(name)
            .ok_or_else(|| RuleSetError::UnknownRule(name.to_string()))
    }

    /// Parses bytes with the named rule.
    pub fn parse(&self, rule: &str, bytes: &[u8]) -> Result<ResultNode, RuleSetError> {
        Ok(self.rule(rule)?.parse_bytes(bytes)?)
    }

    /// Parses from a reader with the named rule.
    pub fn parse_reader<R: Read>(&self, rule: &str, reader: R) -> Result<ResultNode, RuleSetError> {
        Ok(self.rule(rule)?.parse(reader)?)
    }

    /// Generates bytes with the named rule.
    pub fn generate(&self, rule: &str, input: &Value) -> Result<Vec<u8>, RuleSetError> {
        Ok(self.rule(rule)?.generate(input)?)
    }
}
