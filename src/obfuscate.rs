//! Obfuscation Module for bridge symbol names
//!
//! Maps logical names to short tokens. The mapping is injective in both
//! directions and driven by a counter, so the same inputs in the same order
//! always produce the same tokens.

use std::collections::BTreeMap;

const SYMBOL_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Token prefix for application bridge symbols.
pub const APP_PREFIX: &str = "_$";
/// Token prefix for symbols exported by the shared runtime library.
pub const LIB_PREFIX: &str = "HL_";

#[derive(Debug, Clone)]
pub struct Obfuscator {
    prefix: String,
    counter: usize,
    tokens: BTreeMap<String, String>,
    names: BTreeMap<String, String>,
}

impl Default for Obfuscator {
    fn default() -> Self {
        Self::new(APP_PREFIX)
    }
}

/// Bijective base-52 encoding: 0 -> "a", 51 -> "Z", 52 -> "aa".
fn encode(mut n: usize) -> String {
    let radix = SYMBOL_ALPHABET.len();
    let mut out = Vec::new();
    loop {
        out.push(SYMBOL_ALPHABET[n % radix]);
        if n < radix {
            break;
        }
        n = n / radix - 1;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

impl Obfuscator {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            counter: 0,
            tokens: BTreeMap::new(),
            names: BTreeMap::new(),
        }
    }

    /// Token for `name`, allocating the next one on first sight.
    pub fn obfuscate(&mut self, name: &str) -> String {
        if let Some(token) = self.tokens.get(name) {
            return token.clone();
        }
        let mut token = format!("{}{}", self.prefix, encode(self.counter));
        self.counter += 1;
        // Only reachable if a caller registered a foreign token by hand.
        let mut attempts = 0;
        while self.names.contains_key(&token) {
            assert!(
                attempts < SYMBOL_ALPHABET.len(),
                "obfuscation token space exhausted near {}",
                token
            );
            token = format!("{}{}", self.prefix, encode(self.counter));
            self.counter += 1;
            attempts += 1;
        }
        self.tokens.insert(name.to_string(), token.clone());
        self.names.insert(token.clone(), name.to_string());
        token
    }

    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.tokens.get(name).map(String::as_str)
    }

    pub fn original(&self, token: &str) -> Option<&str> {
        self.names.get(token).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Token to original name, the shape written to the symbol map files.
    pub fn symbol_map(&self) -> &BTreeMap<String, String> {
        &self.names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_encode_is_bijective() {
        assert_eq!(encode(0), "a");
        assert_eq!(encode(51), "Z");
        assert_eq!(encode(52), "aa");
        assert_eq!(encode(53), "ab");
        let all: HashSet<String> = (0..5000).map(encode).collect();
        assert_eq!(all.len(), 5000);
    }

    #[test]
    fn test_same_name_same_token() {
        let mut o = Obfuscator::default();
        let a = o.obfuscate("UIView_constructor");
        let b = o.obfuscate("UIView_constructor");
        assert_eq!(a, b);
        assert_eq!(a, "_$a");
        assert_eq!(o.original(&a), Some("UIView_constructor"));
    }

    #[test]
    fn test_distinct_names_never_collide() {
        let mut o = Obfuscator::default();
        let tokens: HashSet<String> = (0..500)
            .map(|i| o.obfuscate(&format!("symbol_{}", i)))
            .collect();
        assert_eq!(tokens.len(), 500);
        assert_eq!(o.symbol_map().len(), 500);
    }

    #[test]
    fn test_reproducible_across_instances() {
        let mut first = Obfuscator::new(LIB_PREFIX);
        let mut second = Obfuscator::new(LIB_PREFIX);
        for name in ["Hyperloop", "Titanium", "Appcelerator"] {
            assert_eq!(first.obfuscate(name), second.obfuscate(name));
        }
        assert_eq!(first.lookup("Titanium"), Some("HL_b"));
    }
}
