//! Function identity and argument fingerprinting.
//!
//! A cache entry is addressed by the pair (function identity, fingerprint).
//! The fingerprint is a SHA-256 digest over a canonical named-argument
//! mapping, so calls that are equivalent up to positional/named spelling
//! produce the same key. Wrappers declare their parameter names up front;
//! Rust call sites cannot be introspected the way a dynamic language's can,
//! so the declaration carries the information instead.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::KeyError;

/// Names a memoized function for cache-collision purposes.
///
/// `module` should carry enough enclosing qualification to keep distinct
/// functions apart, e.g. `"mycrate::geo::Tiler"` for a method and
/// `"mycrate::geo"` for a free function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionId {
    module: String,
    name: String,
}

impl FunctionId {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> FunctionId {
        FunctionId {
            module: module.into(),
            name: name.into(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fully qualified form used as the `function_id` field of shared
    /// store documents.
    pub fn qualified(&self) -> String {
        format!("{}::{}", self.module, self.name)
    }

    /// A stable, filesystem-safe directory name for this function.
    pub fn dir_name(&self) -> String {
        let raw = format!("{}.{}", self.module, self.name);
        raw.chars()
            .map(|c| match c {
                c if c.is_ascii_alphanumeric() => c,
                '.' | '-' | '_' => c,
                _ => '_',
            })
            .collect()
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module, self.name)
    }
}

/// A deterministic token identifying one argument tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Fingerprint {
        Fingerprint(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The lowercase hex form used for per-entry filenames and store keys.
    pub fn as_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for b in self.0 {
            use fmt::Write;
            write!(out, "{b:02x}").expect("writing to a String cannot fail");
        }
        out
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_hex())
    }
}

/// The positional and named arguments of one call, prior to
/// canonicalization.
///
/// Values are converted to their canonical encoding as they are added; a
/// value that cannot be encoded is remembered and reported when the call is
/// made, without invoking the wrapped function.
#[derive(Debug, Clone, Default)]
pub struct Args {
    positional: Vec<Value>,
    named: Vec<(String, Value)>,
    invalid: Option<KeyError>,
}

impl Args {
    pub fn new() -> Args {
        Args::default()
    }

    /// Appends a positional argument.
    pub fn arg(mut self, value: impl Serialize) -> Args {
        match serde_json::to_value(value) {
            Ok(value) => self.positional.push(value),
            Err(err) => self.note_invalid(format!("#{}", self.positional.len()), err),
        }
        self
    }

    /// Appends a named argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Serialize) -> Args {
        let name = name.into();
        match serde_json::to_value(value) {
            Ok(value) => self.named.push((name, value)),
            Err(err) => self.note_invalid(name, err),
        }
        self
    }

    fn note_invalid(&mut self, name: String, err: serde_json::Error) {
        if self.invalid.is_none() {
            self.invalid = Some(KeyError::Unencodable {
                name,
                reason: err.to_string(),
            });
        }
    }
}

/// Builds an [`Args`] value from a mix of positional and named arguments:
///
/// ```
/// # use permacache::args;
/// let a = args![2, 3];
/// let b = args![2, "y" => 3];
/// ```
#[macro_export]
macro_rules! args {
    // internal accumulator rules; must precede the catch-all entry rule
    (@acc $acc:expr $(,)?) => { $acc };
    (@acc $acc:expr, $name:literal => $value:expr $(, $($rest:tt)*)?) => {
        $crate::args!(@acc $acc.kwarg($name, $value) $(, $($rest)*)?)
    };
    (@acc $acc:expr, $value:expr $(, $($rest:tt)*)?) => {
        $crate::args!(@acc $acc.arg($value) $(, $($rest)*)?)
    };
    () => { $crate::Args::new() };
    ($($rest:tt)*) => { $crate::args!(@acc $crate::Args::new(), $($rest)*) };
}

/// The declared shape of a wrapped function: its parameter names, optional
/// declared defaults, and whether the first parameter is a receiver.
#[derive(Debug, Clone, Default)]
pub struct Signature {
    params: Vec<String>,
    defaults: Vec<(String, Value)>,
    is_method: bool,
}

impl Signature {
    pub fn new(
        params: Vec<String>,
        defaults: Vec<(String, Value)>,
        is_method: bool,
    ) -> Signature {
        Signature {
            params,
            defaults,
            is_method,
        }
    }

    pub fn is_method(&self) -> bool {
        self.is_method
    }

    /// Canonicalizes a call's arguments against this signature.
    ///
    /// Positional values bind to declared parameters in order; surplus
    /// positionals get synthesized `__varargs_{i}__` names; declared defaults
    /// fill parameters the call left unset; named arguments bind verbatim.
    pub fn resolve(&self, args: Args) -> Result<ResolvedArgs, KeyError> {
        if let Some(err) = args.invalid {
            return Err(err);
        }
        if self.is_method && self.params.is_empty() {
            return Err(KeyError::MissingReceiver);
        }

        let mut named: BTreeMap<String, Value> = self.defaults.iter().cloned().collect();
        let mut bound_positionally = Vec::new();

        let mut positional = args.positional.into_iter();
        for param in &self.params {
            match positional.next() {
                Some(value) => {
                    named.insert(param.clone(), value);
                    bound_positionally.push(param.as_str());
                }
                None => break,
            }
        }
        for (i, value) in positional.enumerate() {
            named.insert(format!("__varargs_{i}__"), value);
        }

        for (name, value) in args.named {
            if bound_positionally.iter().any(|bound| *bound == name) {
                return Err(KeyError::DuplicateArgument(name));
            }
            named.insert(name, value);
        }

        let elided = self
            .is_method
            .then(|| self.params[0].clone());

        Ok(ResolvedArgs { named, elided })
    }
}

/// A call's arguments after canonicalization: a sorted named mapping, plus
/// the name of the receiver parameter excluded from fingerprinting.
#[derive(Debug, Clone)]
pub struct ResolvedArgs {
    named: BTreeMap<String, Value>,
    elided: Option<String>,
}

impl ResolvedArgs {
    /// Extracts a typed argument by name.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self
            .named
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("missing argument `{name}`"))?;
        serde_json::from_value(value.clone())
            .map_err(|err| anyhow::anyhow!("argument `{name}`: {err}"))
    }

    /// Extracts a typed argument, or `None` when it was not supplied.
    pub fn get_opt<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        match self.named.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| anyhow::anyhow!("argument `{name}`: {err}")),
        }
    }

    /// The full canonical mapping, receiver included.
    pub fn named(&self) -> &BTreeMap<String, Value> {
        &self.named
    }

    /// The pairs contributing to the fingerprint, receiver excluded.
    pub fn keyed(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.named
            .iter()
            .filter(move |(name, _)| Some(name.as_str()) != self.elided.as_deref())
            .map(|(name, value)| (name.as_str(), value))
    }
}

/// Produces fingerprints from resolved arguments.
///
/// Inject a custom implementation (per wrapper or process-wide) to fingerprint
/// argument kinds the default encoding does not handle, or to deliberately
/// ignore arguments.
pub trait KeyMaker: Send + Sync {
    fn make_key(&self, args: &ResolvedArgs) -> Result<Fingerprint, KeyError>;
}

impl<F> KeyMaker for F
where
    F: Fn(&ResolvedArgs) -> Result<Fingerprint, KeyError> + Send + Sync,
{
    fn make_key(&self, args: &ResolvedArgs) -> Result<Fingerprint, KeyError> {
        self(args)
    }
}

/// The default fingerprinter: SHA-256 over a length-prefixed encoding of the
/// sorted `(name, canonical JSON)` pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyMaker;

impl KeyMaker for DefaultKeyMaker {
    fn make_key(&self, args: &ResolvedArgs) -> Result<Fingerprint, KeyError> {
        let mut hasher = Sha256::new();
        for (name, value) in args.keyed() {
            let encoded = serde_json::to_vec(value).map_err(|err| KeyError::Unencodable {
                name: name.to_owned(),
                reason: err.to_string(),
            })?;
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update((encoded.len() as u64).to_le_bytes());
            hasher.update(&encoded);
        }
        Ok(Fingerprint(hasher.finalize().into()))
    }
}
