//! Cache key derivation from call arguments.
//!
//! A [`Signature`] captures a function's declared parameter names (and
//! defaults) once, at setup time. Each call binds its positional and named
//! arguments against that table, filters out the [`IgnoreSet`], and feeds the
//! remaining values in declaration order to a [`KeyBuilder`], which hashes a
//! stable human-readable rendering into the final [`CacheKey`].

use std::collections::HashSet;
use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::BindingError;

/// A key into the cache, derived from the included argument values.
///
/// Two keys are equal iff their digests are equal; the human-readable source
/// that was hashed is kept around for diagnostics only.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    source: Arc<str>,
    hash: [u8; 32],
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl CacheKey {
    /// Creates a key directly from a stable source string.
    ///
    /// This is the escape hatch for callers that already have a canonical
    /// textual identity, such as the token cache's `"{name}:{token_type}"`
    /// entries.
    pub fn of(source: impl Into<String>) -> Self {
        let source = source.into();
        let hash: [u8; 32] = Sha256::digest(source.as_bytes()).into();
        CacheKey {
            source: source.into(),
            hash,
        }
    }

    /// The human-readable input that was hashed to form this key.
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the
/// intention of it is to accept human readable, but most importantly
/// **stable**, input. This input is then hashed to form the [`CacheKey`].
#[derive(Debug, Default)]
pub struct KeyBuilder {
    source: String,
}

impl KeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes one included argument into the key.
    pub fn write_arg(&mut self, name: &str, value: &ArgValue) -> fmt::Result {
        writeln!(self.source, "{name}={value}")
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash: [u8; 32] = Sha256::digest(self.source.as_bytes()).into();
        CacheKey {
            source: self.source.into(),
            hash,
        }
    }
}

impl fmt::Write for KeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.source.write_str(s)
    }
}

/// The hashable projection of one call argument.
///
/// Values with a stable equality representation map to a tagged variant;
/// everything else goes through [`ArgValue::opaque`], which substitutes the
/// value's runtime identity. Derivation therefore never fails, at the cost
/// that opaque arguments are never cache-equal across distinct instances,
/// even if semantically equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgValue {
    Unit,
    Bool(bool),
    Int(i64),
    UInt(u64),
    /// A float, by bit pattern. `NaN` compares equal to the same `NaN` bits.
    Float(u64),
    Str(String),
    Bytes(Vec<u8>),
    Seq(Vec<ArgValue>),
    /// Identity-based surrogate for values without a stable projection.
    Opaque(u64),
}

impl ArgValue {
    /// Projects a value by its runtime identity (its address).
    pub fn opaque<T: ?Sized>(value: &T) -> Self {
        let addr = (value as *const T).cast::<u8>() as usize;
        ArgValue::Opaque(addr as u64)
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Unit => f.write_str("unit"),
            ArgValue::Bool(v) => write!(f, "bool:{v}"),
            ArgValue::Int(v) => write!(f, "int:{v}"),
            ArgValue::UInt(v) => write!(f, "uint:{v}"),
            ArgValue::Float(bits) => write!(f, "float:{bits:016x}"),
            // length-prefixed so a string cannot collide with other renderings
            ArgValue::Str(s) => write!(f, "str:{}:{s}", s.len()),
            ArgValue::Bytes(bytes) => {
                f.write_str("bytes:")?;
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            ArgValue::Seq(values) => {
                write!(f, "seq:{}:[", values.len())?;
                for v in values {
                    write!(f, "{v};")?;
                }
                f.write_str("]")
            }
            ArgValue::Opaque(id) => write!(f, "opaque:{id:#x}"),
        }
    }
}

impl From<()> for ArgValue {
    fn from(_: ()) -> Self {
        ArgValue::Unit
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

macro_rules! argvalue_from_int {
    ($variant:ident: $via:ty => $($ty:ty),+) => {
        $(impl From<$ty> for ArgValue {
            fn from(v: $ty) -> Self {
                ArgValue::$variant(v as $via)
            }
        })+
    };
}

argvalue_from_int!(Int: i64 => i8, i16, i32, i64, isize);
argvalue_from_int!(UInt: u64 => u8, u16, u32, u64, usize);

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v.to_bits())
    }
}

impl From<f32> for ArgValue {
    fn from(v: f32) -> Self {
        ArgValue::Float((v as f64).to_bits())
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_owned())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

impl From<&[u8]> for ArgValue {
    fn from(v: &[u8]) -> Self {
        ArgValue::Bytes(v.to_owned())
    }
}

impl From<Vec<ArgValue>> for ArgValue {
    fn from(v: Vec<ArgValue>) -> Self {
        ArgValue::Seq(v)
    }
}

#[derive(Debug, Clone)]
struct Param {
    name: String,
    default: Option<ArgValue>,
}

/// The declared parameter list of a wrapped unit of work.
///
/// Captured once at setup time; calls are bound against this table rather
/// than any runtime reflection. A method receiver counts as the parameter at
/// position 0.
#[derive(Debug, Clone)]
pub struct Signature {
    params: Vec<Param>,
}

impl Signature {
    pub fn builder() -> SignatureBuilder {
        SignatureBuilder { params: Vec::new() }
    }

    /// Shorthand for a signature of named parameters without defaults.
    pub fn of<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let params = names
            .into_iter()
            .map(|name| Param {
                name: name.into(),
                default: None,
            })
            .collect();
        Signature { params }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Declared parameter names, in declaration order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    /// Binds call arguments against this signature.
    ///
    /// Positional arguments fill parameters in declaration order, named
    /// arguments by name. Declared defaults are applied for unsupplied
    /// parameters; parameters without defaults that are not supplied are
    /// simply absent from the result.
    pub fn bind(&self, args: &CallArgs) -> Result<BoundArgs, BindingError> {
        if args.positional.len() > self.params.len() {
            return Err(BindingError::TooManyPositional {
                expected: self.params.len(),
                got: args.positional.len(),
            });
        }

        let mut values: Vec<Option<ArgValue>> = vec![None; self.params.len()];
        for (idx, value) in args.positional.iter().enumerate() {
            values[idx] = Some(value.clone());
        }
        for (name, value) in &args.named {
            let idx = self
                .position(name)
                .ok_or_else(|| BindingError::UnknownParameter(name.clone()))?;
            if values[idx].is_some() {
                return Err(BindingError::DuplicateParameter(name.clone()));
            }
            values[idx] = Some(value.clone());
        }
        for (idx, param) in self.params.iter().enumerate() {
            if values[idx].is_none() {
                values[idx] = param.default.clone();
            }
        }

        Ok(BoundArgs { values })
    }
}

pub struct SignatureBuilder {
    params: Vec<Param>,
}

impl SignatureBuilder {
    /// Declares the next parameter.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: None,
        });
        self
    }

    /// Declares the next parameter with a default value.
    ///
    /// A call that omits this parameter and a call that passes the default
    /// explicitly produce the same key.
    pub fn param_with_default(
        mut self,
        name: impl Into<String>,
        default: impl Into<ArgValue>,
    ) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: Some(default.into()),
        });
        self
    }

    pub fn build(self) -> Signature {
        Signature {
            params: self.params,
        }
    }
}

/// The positional and named arguments of one call.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    positional: Vec<ArgValue>,
    named: Vec<(String, ArgValue)>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    pub fn arg(mut self, value: impl Into<ArgValue>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Appends a named argument.
    pub fn named(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.named.push((name.into(), value.into()));
        self
    }
}

/// Arguments bound against a [`Signature`], indexed by declared position.
#[derive(Debug, Clone)]
pub struct BoundArgs {
    values: Vec<Option<ArgValue>>,
}

impl BoundArgs {
    /// The bound value at a declared position, if supplied or defaulted.
    pub fn get(&self, idx: usize) -> Option<&ArgValue> {
        self.values.get(idx).and_then(|v| v.as_ref())
    }
}

/// Parameters excluded from key derivation, by name or declared position.
///
/// Indices are resolved to parameter names against the signature, so ignoring
/// the same parameter by name and by position is equivalent and does not
/// double-count. Entries that match no declared parameter are inert.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    entries: Vec<IgnoreEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum IgnoreEntry {
    Name(String),
    Position(usize),
}

impl IgnoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ignores a parameter by declared name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.entries.push(IgnoreEntry::Name(name.into()));
        self
    }

    /// Ignores a parameter by zero-based declared position.
    pub fn position(mut self, idx: usize) -> Self {
        self.entries.push(IgnoreEntry::Position(idx));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn resolve(&self, signature: &Signature) -> HashSet<usize> {
        let mut positions = HashSet::new();
        for entry in &self.entries {
            match entry {
                IgnoreEntry::Position(idx) => {
                    if *idx < signature.len() {
                        positions.insert(*idx);
                    }
                }
                IgnoreEntry::Name(name) => {
                    if let Some(idx) = signature.position(name) {
                        positions.insert(idx);
                    }
                }
            }
        }
        positions
    }
}

/// Derives [`CacheKey`]s for one wrapped unit of work.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    signature: Signature,
    ignore: IgnoreSet,
}

impl KeyDeriver {
    pub fn new(signature: Signature, ignore: IgnoreSet) -> Self {
        KeyDeriver { signature, ignore }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn ignore(&self) -> &IgnoreSet {
        &self.ignore
    }

    /// Derives the canonical key for one call.
    ///
    /// Included arguments are written in declaration order, so named and
    /// positional spellings of the same call collide correctly.
    pub fn derive(&self, args: &CallArgs) -> Result<CacheKey, BindingError> {
        let bound = self.signature.bind(args)?;
        let ignored = self.ignore.resolve(&self.signature);

        let mut builder = KeyBuilder::new();
        for (idx, param) in self.signature.params.iter().enumerate() {
            if ignored.contains(&idx) {
                continue;
            }
            let Some(value) = bound.get(idx) else {
                continue;
            };
            builder.write_arg(&param.name, value).unwrap();
        }
        Ok(builder.build())
    }
}
