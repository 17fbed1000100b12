//! Integrity (identity) values carried by messages.
//!
//! A message's `integrity` field is a tagged pair `{method, value}`. The method
//! set is closed: every method the pump understands is a variant of
//! [`IntegrityMethod`], and the methods whose value can be computed locally
//! have a [`Checksum`] implementation reachable through [`Algorithm`].
//!
//! Values are standard base64 of the raw digest.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

/// The identity algorithm named by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityMethod {
    /// MD5 over file content.
    Md5,
    /// SHA-512 over file content.
    Sha512,
    /// MD5 over the file name only.
    Md5name,
    /// An external signature that cannot be recomputed locally.
    Arbitrary,
    /// A random value; every announcement is distinct.
    Random,
    /// A symbolic link announcement.
    Link,
    /// A file removal announcement.
    Remove,
    /// Checksum-on-download: the value names the algorithm to apply on receipt.
    Cod,
}

impl IntegrityMethod {
    /// Returns the wire name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrityMethod::Md5 => "md5",
            IntegrityMethod::Sha512 => "sha512",
            IntegrityMethod::Md5name => "md5name",
            IntegrityMethod::Arbitrary => "arbitrary",
            IntegrityMethod::Random => "random",
            IntegrityMethod::Link => "link",
            IntegrityMethod::Remove => "remove",
            IntegrityMethod::Cod => "cod",
        }
    }

    /// Whether the value is unrelated to file content, so deduplication has to
    /// fall back on file metadata (mtime or size).
    pub fn is_content_free(&self) -> bool {
        matches!(self, IntegrityMethod::Arbitrary | IntegrityMethod::Cod)
    }
}

impl fmt::Display for IntegrityMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `integrity` field of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Integrity {
    pub method: IntegrityMethod,
    pub value: String,
}

impl Integrity {
    pub fn new(method: IntegrityMethod, value: impl Into<String>) -> Self {
        Integrity {
            method,
            value: value.into(),
        }
    }
}

/// Capability shared by every computable integrity algorithm.
pub trait Checksum {
    /// Announces the path being summed. Resets any accumulated state.
    fn set_path(&mut self, path: &str);

    /// Feeds a chunk of file content.
    fn update(&mut self, chunk: &[u8]);

    /// Returns the encoded value for everything fed so far.
    fn value(&self) -> String;
}

/// MD5 over content.
#[derive(Clone, Default)]
pub struct Md5Sum {
    hasher: Md5,
}

impl fmt::Debug for Md5Sum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Md5Sum").finish_non_exhaustive()
    }
}

impl Checksum for Md5Sum {
    fn set_path(&mut self, _path: &str) {
        self.hasher = Md5::new();
    }

    fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    fn value(&self) -> String {
        STANDARD.encode(self.hasher.clone().finalize())
    }
}

/// SHA-512 over content.
#[derive(Clone, Default)]
pub struct Sha512Sum {
    hasher: Sha512,
}

impl fmt::Debug for Sha512Sum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sha512Sum").finish_non_exhaustive()
    }
}

impl Checksum for Sha512Sum {
    fn set_path(&mut self, _path: &str) {
        self.hasher = Sha512::new();
    }

    fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    fn value(&self) -> String {
        STANDARD.encode(self.hasher.clone().finalize())
    }
}

/// MD5 over the final path component. Content updates are ignored.
#[derive(Debug, Clone, Default)]
pub struct Md5NameSum {
    name: String,
}

impl Checksum for Md5NameSum {
    fn set_path(&mut self, path: &str) {
        self.name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
    }

    fn update(&mut self, _chunk: &[u8]) {}

    fn value(&self) -> String {
        STANDARD.encode(Md5::digest(self.name.as_bytes()))
    }
}

/// An externally supplied signature, reported as-is.
#[derive(Debug, Clone, Default)]
pub struct ArbitrarySum {
    value: String,
}

impl ArbitrarySum {
    pub fn new(value: impl Into<String>) -> Self {
        ArbitrarySum {
            value: value.into(),
        }
    }

    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }
}

impl Checksum for ArbitrarySum {
    fn set_path(&mut self, _path: &str) {}

    fn update(&mut self, _chunk: &[u8]) {}

    fn value(&self) -> String {
        self.value.clone()
    }
}

/// A computable algorithm, selected by method.
#[derive(Debug, Clone)]
pub enum Algorithm {
    Md5(Md5Sum),
    Sha512(Sha512Sum),
    Md5Name(Md5NameSum),
    Arbitrary(ArbitrarySum),
}

impl Algorithm {
    /// Returns the algorithm for `method`, or `None` when the method has no
    /// locally computable value (random, link, remove, cod).
    ///
    /// `arbitrary_value` is only consulted for [`IntegrityMethod::Arbitrary`].
    pub fn for_method(method: IntegrityMethod, arbitrary_value: &str) -> Option<Self> {
        match method {
            IntegrityMethod::Md5 => Some(Algorithm::Md5(Md5Sum::default())),
            IntegrityMethod::Sha512 => Some(Algorithm::Sha512(Sha512Sum::default())),
            IntegrityMethod::Md5name => Some(Algorithm::Md5Name(Md5NameSum::default())),
            IntegrityMethod::Arbitrary => {
                Some(Algorithm::Arbitrary(ArbitrarySum::new(arbitrary_value)))
            }
            IntegrityMethod::Random
            | IntegrityMethod::Link
            | IntegrityMethod::Remove
            | IntegrityMethod::Cod => None,
        }
    }

    pub fn method(&self) -> IntegrityMethod {
        match self {
            Algorithm::Md5(_) => IntegrityMethod::Md5,
            Algorithm::Sha512(_) => IntegrityMethod::Sha512,
            Algorithm::Md5Name(_) => IntegrityMethod::Md5name,
            Algorithm::Arbitrary(_) => IntegrityMethod::Arbitrary,
        }
    }

    /// Packages the current value as a message `integrity` field.
    pub fn integrity(&self) -> Integrity {
        Integrity::new(self.method(), self.value())
    }

    fn inner(&mut self) -> &mut dyn Checksum {
        match self {
            Algorithm::Md5(sum) => sum,
            Algorithm::Sha512(sum) => sum,
            Algorithm::Md5Name(sum) => sum,
            Algorithm::Arbitrary(sum) => sum,
        }
    }
}

impl Checksum for Algorithm {
    fn set_path(&mut self, path: &str) {
        self.inner().set_path(path);
    }

    fn update(&mut self, chunk: &[u8]) {
        self.inner().update(chunk);
    }

    fn value(&self) -> String {
        match self {
            Algorithm::Md5(sum) => sum.value(),
            Algorithm::Sha512(sum) => sum.value(),
            Algorithm::Md5Name(sum) => sum.value(),
            Algorithm::Arbitrary(sum) => sum.value(),
        }
    }
}

const READ_CHUNK: usize = 64 * 1024;

/// Computes the integrity of a file on disk with the given method.
///
/// Returns `Ok(None)` for methods that cannot be computed locally.
pub fn compute_file_integrity(
    path: &Path,
    method: IntegrityMethod,
    arbitrary_value: &str,
) -> io::Result<Option<Integrity>> {
    let Some(mut algorithm) = Algorithm::for_method(method, arbitrary_value) else {
        return Ok(None);
    };
    algorithm.set_path(&path.to_string_lossy());

    if matches!(method, IntegrityMethod::Md5 | IntegrityMethod::Sha512) {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            algorithm.update(&buf[..n]);
        }
    }

    Ok(Some(algorithm.integrity()))
}
