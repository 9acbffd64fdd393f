//! Guest-side source snippets and parsers for their replies.
//!
//! The primitives named here are HolyC functions deployed by
//! [`Session::freeze`](super::Session::freeze); their reply formats are a
//! contract with those sources.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;

/// Primitive sources included by `freeze`, in dependency order.
pub const PRIMITIVES: &[&str] = &[
    "SerDir",
    "SerFileRead",
    "SerFileWrite",
    "SerFileExists",
    "SerMkDir",
    "SerExecI64",
    "SerExecStr",
    "SerSymExists",
    "SerSymList",
    "SerMemInfo",
];

/// Name of the print helper written during `freeze`.
pub const PRINT_HELPER_NAME: &str = "SerPrint";

/// Print helper source. Not shipped in the base snapshot, so `freeze`
/// writes it before including it.
pub const PRINT_HELPER: &[u8] = b"U8 g_sp[4096];\n\
U0 SerPrint(U8 *s){SerSend(s);}\n\
U0 SerFmt(U8 *fmt,I64 a,I64 b){StrPrint(g_sp,fmt,a,b);SerSend(g_sp);}\n";

/// No-op statement used as a liveness check.
pub const NOOP: &str = ";";

/// Stops the command wrapper's loop.
pub const EXIT: &str = "EXIT";

/// Reads the scratch global written by [`assign_scratch`].
pub const GET_SCRATCH: &str = "SerGetI64(g_r);";

/// Primary frame sent by the wrapper itself when the user code threw before
/// producing a payload.
pub const BARE_ACK: &[u8] = b"OK";

/// Quotes `s` as a HolyC string literal.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// `#include "<path>";`
pub fn include(path: &str) -> String {
    format!("#include {};", quote(path))
}

/// Guest path of a primitive's source.
pub fn primitive_path(dir: &str, name: &str) -> String {
    format!("{}/{name}.HC", dir.trim_end_matches('/'))
}

/// Lists entries matching a wildcard pattern.
pub fn list_dir(pattern: &str) -> String {
    format!("SerDir({});", quote(pattern))
}

/// Streams a file's bytes as the primary frame.
pub fn file_read(path: &str) -> String {
    format!("SerFileRead({});", quote(path))
}

/// Starts the file-write sub-protocol.
pub fn file_write(path: &str) -> String {
    format!("SerFileWrite({});", quote(path))
}

/// Replies `1` when the file exists.
pub fn file_exists(path: &str) -> String {
    format!("SerFileExists({});", quote(path))
}

/// Creates a directory.
pub fn mkdir(path: &str) -> String {
    format!("SerMkDir({});", quote(path))
}

/// Stores an expression's value in the scratch global.
pub fn assign_scratch(expr: &str) -> String {
    format!("g_r={expr};")
}

/// Runs `code` with a fresh string buffer and sends the buffer.
pub fn string_eval(code: &str) -> String {
    format!("GStrReset();{code}SerSendStr();")
}

/// Replies `1` when `name` is in the symbol table.
pub fn symbol_exists(name: &str) -> String {
    format!("SerSymExists({});", quote(name))
}

/// Lists symbols selected by `mask` as `name\tkind` rows.
pub fn symbol_list(mask: SymbolMask) -> String {
    format!("SerSymList({});", mask.bits())
}

/// Emits memory statistics as `key\tvalue` rows.
pub const MEM_INFO: &str = "SerMemInfo();";

/// Symbol categories selected by a listing query.
///
/// The bit values are shared with the guest's hash-table type flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolMask(u32);

impl SymbolMask {
    /// Global variables.
    pub const GLOBALS: Self = Self(8);
    /// Classes.
    pub const CLASSES: Self = Self(16);
    /// Functions.
    pub const FUNCTIONS: Self = Self(64);
    /// Every symbol kind.
    pub const ALL: Self = Self(131_071);

    /// Wraps raw guest bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw guest bits.
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for SymbolMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::str::FromStr for SymbolMask {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "functions" => Ok(Self::FUNCTIONS),
            "globals" => Ok(Self::GLOBALS),
            "classes" => Ok(Self::CLASSES),
            "all" => Ok(Self::ALL),
            other => other
                .parse::<u32>()
                .map(Self)
                .map_err(|_| format!("unknown symbol kind: {s}")),
        }
    }
}

impl fmt::Display for SymbolMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A memory statistic: integer when it parses, text otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MemValue {
    /// Numeric value.
    Int(i64),
    /// Anything else, verbatim.
    Text(String),
}

/// `true` for drive-rooted guest paths such as `C:/Home/Foo.HC`.
pub fn is_absolute(path: &str) -> bool {
    let b = path.as_bytes();
    b.len() >= 3 && b[0].is_ascii_alphabetic() && b[1] == b':' && b[2] == b'/'
}

/// Parses a directory listing, dropping `.`/`..` and anything that is not
/// an absolute path.
pub fn parse_listing(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .lines()
        .map(|l| l.replace('\0', ""))
        .map(|l| l.trim().to_owned())
        .filter(|l| !l.is_empty() && !l.ends_with("/.") && !l.ends_with("/..") && is_absolute(l))
        .collect()
}

/// Splits non-empty lines on tabs.
pub fn parse_rows(text: &str) -> Vec<Vec<String>> {
    text.lines()
        .filter(|l| !l.is_empty())
        .map(|l| l.split('\t').map(str::to_owned).collect())
        .collect()
}

/// Parses `name\tkind` rows; a missing kind is empty.
pub fn parse_symbols(raw: &[u8]) -> Vec<(String, String)> {
    parse_rows(&String::from_utf8_lossy(raw))
        .into_iter()
        .filter_map(|mut r| {
            let kind = if r.len() > 1 { r.swap_remove(1) } else { String::new() };
            r.into_iter().next().map(|name| (name, kind))
        })
        .collect()
}

/// Turns `key\tvalue` rows into a map; later duplicates win.
pub fn rows_to_kv(rows: Vec<Vec<String>>) -> BTreeMap<String, String> {
    rows.into_iter()
        .filter_map(|r| {
            let mut it = r.into_iter();
            let key = it.next()?;
            Some((key, it.next().unwrap_or_default()))
        })
        .collect()
}

/// Types memory statistics.
pub fn parse_mem_info(kv: BTreeMap<String, String>) -> BTreeMap<String, MemValue> {
    kv.into_iter()
        .map(|(k, v)| {
            let value = v
                .trim()
                .parse::<i64>()
                .map_or_else(|_| MemValue::Text(v.clone()), MemValue::Int);
            (k, value)
        })
        .collect()
}
