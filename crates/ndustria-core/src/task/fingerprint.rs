//! Task fingerprints
//!
//! A fingerprint is the SHA-256 of, in order: the callable name, its
//! whitespace-stripped logic text, the fingerprint of every dependency in
//! declaration order, the string form of every positional argument, and
//! every keyword argument as `key` followed by its value.
//!
//! Every field is framed by its byte length and every list by its item
//! count, so adjacent fields can never run together.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex digest identifying a task's cached result
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute a fingerprint from already-stringified inputs
    pub fn compute<'a>(
        name: &str,
        logic: &str,
        dependencies: impl IntoIterator<Item = &'a Fingerprint>,
        args: &[String],
        kwargs: &BTreeMap<String, String>,
    ) -> Self {
        let mut hasher = Sha256::new();

        field(&mut hasher, name);
        field(&mut hasher, &normalize_logic(logic));

        let dependencies: Vec<&Fingerprint> = dependencies.into_iter().collect();
        count(&mut hasher, dependencies.len());
        for dep in dependencies {
            field(&mut hasher, &dep.0);
        }

        count(&mut hasher, args.len());
        for arg in args {
            field(&mut hasher, arg);
        }

        count(&mut hasher, kwargs.len());
        for (key, value) in kwargs {
            field(&mut hasher, key);
            field(&mut hasher, value);
        }

        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight hex digits, for logs and descriptions
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn count(hasher: &mut Sha256, n: usize) {
    hasher.update((n as u64).to_le_bytes());
}

fn field(hasher: &mut Sha256, text: &str) {
    count(hasher, text.len());
    hasher.update(text.as_bytes());
}

/// Strip every whitespace character so reformatting does not change identity
pub fn normalize_logic(logic: &str) -> String {
    logic.chars().filter(|c| !c.is_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(name: &str, logic: &str, deps: &[&Fingerprint], args: &[&str]) -> Fingerprint {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        Fingerprint::compute(name, logic, deps.iter().copied(), &args, &BTreeMap::new())
    }

    #[test]
    fn test_deterministic() {
        let a = fp("load", "|x| x + 1", &[], &["10"]);
        let b = fp("load", "|x| x + 1", &[], &["10"]);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_whitespace_insensitive() {
        let a = fp("load", "|x| x + 1", &[], &[]);
        let b = fp("load", "|x|\n    x+1", &[], &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_sensitive_to_each_input() {
        let dep = fp("dep", "d", &[], &[]);
        let other_dep = fp("dep", "d2", &[], &[]);
        let base = fp("f", "body", &[&dep], &["1"]);

        assert_ne!(base, fp("g", "body", &[&dep], &["1"]));
        assert_ne!(base, fp("f", "body2", &[&dep], &["1"]));
        assert_ne!(base, fp("f", "body", &[&other_dep], &["1"]));
        assert_ne!(base, fp("f", "body", &[&dep], &["2"]));
    }

    #[test]
    fn test_kwargs_change_identity() {
        let mut small = BTreeMap::new();
        small.insert("n".to_string(), "10".to_string());
        let mut large = BTreeMap::new();
        large.insert("n".to_string(), "20".to_string());

        let a = Fingerprint::compute("a", "body", [], &[], &small);
        let b = Fingerprint::compute("a", "body", [], &[], &large);
        assert_ne!(a, b);
    }

    #[test]
    fn test_argument_boundaries() {
        assert_ne!(fp("add", "body", &[], &["1", "23"]), fp("add", "body", &[], &["12", "3"]));
        assert_ne!(fp("add", "body", &[], &["1", ""]), fp("add", "body", &[], &["1"]));
        assert_ne!(fp("ab", "c", &[], &[]), fp("a", "bc", &[], &[]));
    }

    #[test]
    fn test_kwarg_boundaries() {
        let mut split_value = BTreeMap::new();
        split_value.insert("n".to_string(), "10".to_string());
        let mut split_key = BTreeMap::new();
        split_key.insert("n1".to_string(), "0".to_string());

        let a = Fingerprint::compute("a", "body", [], &[], &split_value);
        let b = Fingerprint::compute("a", "body", [], &[], &split_key);
        assert_ne!(a, b);

        // A positional "n" and "10" must not look like the kwarg n=10
        let args = vec!["n".to_string(), "10".to_string()];
        let c = Fingerprint::compute("a", "body", [], &args, &BTreeMap::new());
        assert_ne!(a, c);
    }

    #[test]
    fn test_short() {
        let a = fp("a", "b", &[], &[]);
        assert_eq!(a.short().len(), 8);
        assert!(a.as_str().starts_with(a.short()));
    }
}
