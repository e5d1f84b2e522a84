//! Source Embedding Module
//!
//! Script source shipped inside the native binary is whitespace-trimmed,
//! base64-encoded and stored as a byte table XOR-ed with a constant, so it
//! is not readable with `strings`. A per-table decoder macro restores it at
//! load time.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

pub const DEFAULT_XOR: &str = "0xAC";

/// Entries per line in a generated table.
const SPLIT: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedSource {
    /// Comma-separated `_('c')` entries.
    pub source: String,
    pub length: usize,
}

/// Normalizes `code` (each line trimmed, blank lines dropped) and encodes it
/// as table entries.
pub fn transform(code: &str) -> EmbeddedSource {
    let input = code
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let encoded = STANDARD.encode(input.trim().as_bytes());

    let mut output = String::with_capacity(encoded.len() * 8);
    let mut length = 0;
    for (i, c) in encoded.chars().enumerate() {
        let value = match c {
            '\'' => "\\'".to_string(),
            '\\' => "\\\\".to_string(),
            _ => c.to_string(),
        };
        if i != 0 {
            output.push_str(", ");
        }
        if i % SPLIT == 0 {
            output.push_str("\n\t");
        }
        output.push_str(&format!("_('{}')", value));
        length += 1;
    }

    EmbeddedSource {
        source: output.trim().to_string(),
        length,
    }
}

pub fn define(varname: &str, embedded: &EmbeddedSource) -> String {
    format!(
        "static const char {v}[] = {{\n\t{src}\n}};\nstatic const size_t {v}_length = {len};\n",
        v = varname,
        src = embedded.source,
        len = embedded.length
    )
}

pub fn decoder(varname: &str) -> String {
    format!(
        "#define HL_DECODE_{v}(array,buf)\\\nfor (size_t i = 0; i < {v}_length; i++) {{\\\n\tbuf[i] = array[i] ^ _HL_XOR;\\\n}}\n",
        v = varname
    )
}

/// XOR key and entry macro followed by every table definition.
pub fn body(xor: Option<&str>, defines: &[String]) -> String {
    format!(
        "#define _HL_XOR {}\n#define _(v) (char)((int)v^_HL_XOR)\n\n{}",
        xor.unwrap_or(DEFAULT_XOR),
        defines.join("\n")
    )
}

/// Statements decoding table `varname` into the engine string `target`.
/// `buf` and `result` are fresh temporaries.
pub fn decode(varname: &str, indent: &str, buf: &str, result: &str, target: &str) -> Vec<String> {
    vec![
        format!("{}char {}[{}_length+1];", indent, buf, varname),
        format!("{}memset({},0,{}_length);", indent, buf, varname),
        format!("{}{}[{}_length]='\\0';", indent, buf, varname),
        format!("{}HL_DECODE_{}({},{});", indent, varname, varname, buf),
        format!(
            "{}std::string {} = base64_decode(std::string({}));",
            indent, result, buf
        ),
        format!(
            "{}auto {} = JSStringCreateWithUTF8CString({}.c_str());",
            indent, target, result
        ),
        format!("{}memset({},0,{}_length);", indent, buf, varname),
    ]
}

/// Table identifier for a module id. Stable across runs so regenerated
/// units stay byte-identical.
pub fn varname(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    let tag: String = digest.iter().take(3).map(|b| format!("{:02x}", b)).collect();
    let clean: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("_{}_{}", tag, clean)
}
