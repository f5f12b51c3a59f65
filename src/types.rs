/* Types for Android class loader context descriptors e.g. PCL[base.apk*123] */
/* The descriptor records the class loader chain some dex code was compiled against. */

use crate::context_parse::parse_context;
use crate::context_verify::{find_duplicate_dex_files, verify_context_match};
use crate::context_write::{encode_classpath_contexts, encode_context, EncodeForm};
use crate::dex::{open_context_dex_files, DexHandle, DexResolver, InstructionSet};
use crate::hierarchy::{build_class_loader, context_from_class_loader, ManagedRuntime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::str::FromStr;

/* Custom error for context operations */
#[derive(Debug)]
pub struct ContextError {
    pub details: String,
}

impl ContextError {
    pub fn new(msg: &str) -> ContextError {
        ContextError {
            details: msg.to_string(),
        }
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.details)
    }
}

impl Error for ContextError {
    fn description(&self) -> &str {
        &self.details
    }
}

/// Descriptor for a unit that is a standalone shared library: verification is
/// skipped entirely for these.
pub const SPECIAL_SHARED_LIBRARY: &str = "&";

/// Location recorded for in-memory dex files, which have no path on disk.
pub const IN_MEMORY_DEX_LOCATION: &str = "<unknown>";

/// Encoding produced for any chain containing a class loader this crate cannot
/// describe. Consumers treat it as "context unknown, do not trust compiled code".
pub const UNSUPPORTED_CONTEXT_ENCODING: &str = "=UnsupportedClassLoaderContext=";

/// The three class loader kinds the descriptor grammar can express, with their
/// wire tokens
///
/// # Examples
///
/// ```
///  use clcontext::types::LoaderKind;
///  use std::str::FromStr;
///
///  let k = LoaderKind::from_str("DLC").unwrap();
///  assert_eq!(k, LoaderKind::DelegateLastClassLoader);
///  assert_eq!(k.to_str(), "DLC");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoaderKind {
    PathClassLoader,
    DelegateLastClassLoader,
    InMemoryDexClassLoader,
}

impl FromStr for LoaderKind {
    type Err = ContextError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PCL" => Self::PathClassLoader,
            "DLC" => Self::DelegateLastClassLoader,
            "IMC" => Self::InMemoryDexClassLoader,
            _ => {
                return Err(ContextError {
                    details: format!("Unknown class loader kind: {s}"),
                });
            }
        })
    }
}

impl LoaderKind {
    pub fn to_str(&self) -> &str {
        match self {
            Self::PathClassLoader => "PCL",
            Self::DelegateLastClassLoader => "DLC",
            Self::InMemoryDexClassLoader => "IMC",
        }
    }
}

impl fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

/// One dex file location in a loader's classpath, with its checksum when known.
/// IMC entries always use the `<unknown>` location and always carry a checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClasspathEntry {
    pub location: String,
    pub checksum: Option<u32>,
}

impl ClasspathEntry {
    pub fn new(location: &str) -> ClasspathEntry {
        ClasspathEntry {
            location: location.to_string(),
            checksum: None,
        }
    }

    pub fn with_checksum(location: &str, checksum: u32) -> ClasspathEntry {
        ClasspathEntry {
            location: location.to_string(),
            checksum: Some(checksum),
        }
    }
}

/// One class loader in the chain: its kind, its declared classpath, the dex
/// files opened for that classpath and any attached shared library loaders
#[derive(Debug, Clone)]
pub struct LoaderInfo {
    pub kind: LoaderKind,
    pub classpath: Vec<ClasspathEntry>,
    /// After a successful open_dex_files this holds one handle per classpath entry
    pub opened_dex_files: Vec<DexHandle>,
    pub shared_libraries: Vec<LoaderInfo>,
}

impl LoaderInfo {
    pub fn new(kind: LoaderKind) -> LoaderInfo {
        LoaderInfo {
            kind,
            classpath: vec![],
            opened_dex_files: vec![],
            shared_libraries: vec![],
        }
    }
}

/// One element of the loader chain. Reverse introspection records loaders of a
/// foreign type as Unsupported instead of giving up on the whole chain; every
/// encoding derived from such a chain collapses to UNSUPPORTED_CONTEXT_ENCODING.
#[derive(Debug, Clone)]
pub enum ChainEntry {
    Loader(LoaderInfo),
    Unsupported { dex_locations: Vec<String> },
}

impl ChainEntry {
    pub fn is_supported(&self) -> bool {
        matches!(self, ChainEntry::Loader(_))
    }

    pub fn loader(&self) -> Option<&LoaderInfo> {
        match self {
            ChainEntry::Loader(info) => Some(info),
            ChainEntry::Unsupported { .. } => None,
        }
    }
}

/// Whether the classpath has been resolved to opened dex files, and with what
/// outcome. The transition away from Unresolved happens once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    Unresolved,
    Resolved(bool),
}

/// Outcome of matching a stored descriptor against the context observed at
/// load time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationResult {
    Verifies,
    ForcedToSkipChecks,
    Mismatch,
}

/// A class loader context: the chain of loaders (most derived first, the boot
/// class loader above the last) that some dex code runs under, either parsed
/// from a descriptor string or read back from a live hierarchy
///
/// # Examples
///
/// ```
///  use clcontext::types::{ClassLoaderContext, LoaderKind};
///
///  let ctx = ClassLoaderContext::create("PCL[a.dex:b.dex];DLC[c.dex]").unwrap();
///  assert_eq!(ctx.chain_len(), 2);
///  assert_eq!(ctx.loader(0).kind, LoaderKind::PathClassLoader);
///  assert_eq!(ctx.loader(1).classpath[0].location, "c.dex");
/// ```
#[derive(Debug, Clone)]
pub struct ClassLoaderContext {
    pub(crate) chain: Vec<ChainEntry>,
    pub(crate) special_shared_library: bool,
    pub(crate) resolution: ResolutionState,
    pub(crate) owns_dex_files: bool,
}

impl ClassLoaderContext {
    pub(crate) fn from_chain(chain: Vec<ChainEntry>) -> ClassLoaderContext {
        ClassLoaderContext {
            chain,
            special_shared_library: false,
            resolution: ResolutionState::Unresolved,
            owns_dex_files: true,
        }
    }

    pub(crate) fn special() -> ClassLoaderContext {
        ClassLoaderContext {
            chain: vec![],
            special_shared_library: true,
            resolution: ResolutionState::Unresolved,
            owns_dex_files: true,
        }
    }

    /// Parses a descriptor in the form used on the dex2oat command line, without
    /// checksums. Returns None for any malformed input.
    ///
    /// # Examples
    ///
    /// ```
    ///  use clcontext::types::ClassLoaderContext;
    ///
    ///  let ctx = ClassLoaderContext::create("PCL[a.dex]{PCL[lib.dex]}").unwrap();
    ///  assert_eq!(ctx.loader(0).shared_libraries.len(), 1);
    /// ```
    pub fn create(spec: &str) -> Option<ClassLoaderContext> {
        ClassLoaderContext::parse(spec, false)
    }

    /// Parses a descriptor. With `parse_checksums` every classpath entry must
    /// carry a `*checksum` suffix, as in the form stored inside oat files.
    pub fn parse(spec: &str, parse_checksums: bool) -> Option<ClassLoaderContext> {
        parse_context(spec, parse_checksums)
    }

    /// True when the string is either a well formed descriptor or the sentinel
    /// recorded for contexts that cannot be described.
    ///
    /// # Examples
    ///
    /// ```
    ///  use clcontext::types::ClassLoaderContext;
    ///
    ///  assert!(ClassLoaderContext::is_valid_encoding("PCL[foo.dex]"));
    ///  assert!(ClassLoaderContext::is_valid_encoding("=UnsupportedClassLoaderContext="));
    ///  assert!(!ClassLoaderContext::is_valid_encoding("not_valid"));
    /// ```
    pub fn is_valid_encoding(spec: &str) -> bool {
        spec == UNSUPPORTED_CONTEXT_ENCODING || ClassLoaderContext::create(spec).is_some()
    }

    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    pub fn entry(&self, index: usize) -> &ChainEntry {
        &self.chain[index]
    }

    /// The chain element at `index`. Panics when the index is out of range or
    /// the element was recorded as an unsupported loader kind.
    pub fn loader(&self, index: usize) -> &LoaderInfo {
        match &self.chain[index] {
            ChainEntry::Loader(info) => info,
            ChainEntry::Unsupported { .. } => {
                panic!("chain element {index} is an unsupported class loader")
            }
        }
    }

    pub fn is_special_shared_library(&self) -> bool {
        self.special_shared_library
    }

    pub fn resolution(&self) -> ResolutionState {
        self.resolution
    }

    /// False when the dex handles were borrowed from a live hierarchy rather
    /// than opened by this context.
    pub fn owns_dex_files(&self) -> bool {
        self.owns_dex_files
    }

    pub fn has_unsupported_element(&self) -> bool {
        self.chain.iter().any(|e| !e.is_supported())
    }

    /// Opens every dex file named by the classpaths of the chain and of all
    /// shared library subtrees, resolving relative locations against
    /// `classpath_dir`. Every entry is attempted even after a failure so all
    /// problems get reported; any failure leaves the context unusable for
    /// building a hierarchy. Returns the overall success.
    pub fn open_dex_files(
        &mut self,
        resolver: &dyn DexResolver,
        isa: InstructionSet,
        classpath_dir: &str,
    ) -> bool {
        open_context_dex_files(self, resolver, isa, classpath_dir)
    }

    /// Removes every classpath entry (and its opened dex file, when resolution
    /// has happened) whose location appears in `locations`. Shared libraries
    /// are left alone. Returns true when anything was removed.
    ///
    /// # Examples
    ///
    /// ```
    ///  use clcontext::types::ClassLoaderContext;
    ///
    ///  let mut ctx = ClassLoaderContext::create("PCL[a.dex:b.dex]").unwrap();
    ///  assert!(ctx.remove_locations(&["b.dex"]));
    ///  assert_eq!(ctx.encode_for_dex2oat(""), "PCL[a.dex]");
    /// ```
    pub fn remove_locations(&mut self, locations: &[&str]) -> bool {
        let mut removed = false;
        for entry in &mut self.chain {
            if let ChainEntry::Loader(info) = entry {
                let initial = info.classpath.len();
                if info.opened_dex_files.len() == initial {
                    let mut kept_entries = Vec::with_capacity(initial);
                    let mut kept_files = Vec::with_capacity(initial);
                    for (e, f) in info
                        .classpath
                        .drain(..)
                        .zip(info.opened_dex_files.drain(..))
                    {
                        if locations.contains(&e.location.as_str()) {
                            continue;
                        }
                        kept_entries.push(e);
                        kept_files.push(f);
                    }
                    info.classpath = kept_entries;
                    info.opened_dex_files = kept_files;
                } else {
                    info.classpath
                        .retain(|e| !locations.contains(&e.location.as_str()));
                }
                if info.classpath.len() != initial {
                    removed = true;
                }
            }
        }
        removed
    }

    /// Encodes the context in the form stored inside oat files: checksums on
    /// every entry, shared libraries included, locations rebased against
    /// `base_dir` where they sit under it.
    pub fn encode_for_oat_file(&self, base_dir: &str) -> String {
        encode_context(self, EncodeForm::OatFile, base_dir)
    }

    /// Encodes the context as passed to dex2oat: no checksums, no shared
    /// libraries, multidex members folded back into their base location.
    pub fn encode_for_dex2oat(&self, base_dir: &str) -> String {
        encode_context(self, EncodeForm::Dex2oat, base_dir)
    }

    /// For every distinct dex location in the chain, the descriptor that one
    /// dex file would be compiled against in isolation, keyed by base location.
    pub fn encode_classpath_contexts(&self, base_dir: &str) -> BTreeMap<String, String> {
        encode_classpath_contexts(self, base_dir)
    }

    /// Matches a stored descriptor against this context. `candidate_spec` is
    /// parsed with checksums; the chains must agree element for element, in
    /// order, shared libraries included.
    pub fn verify_context_match(&self, candidate_spec: &str) -> VerificationResult {
        verify_context_match(self, candidate_spec)
    }

    /// Returns the subset of `dex_files` already present somewhere in this
    /// context (chain or shared libraries) by location and checksum.
    pub fn check_for_duplicate_dex_files<'a>(
        &self,
        dex_files: &[&'a DexHandle],
    ) -> Vec<&'a DexHandle> {
        find_duplicate_dex_files(self, dex_files)
    }

    /// Instantiates the chain through the runtime, most derived loader last,
    /// and returns its handle. `compilation_sources` are appended to the first
    /// element's dex files. Requires a successful open_dex_files.
    pub fn create_class_loader<R: ManagedRuntime>(
        &self,
        runtime: &mut R,
        compilation_sources: &[DexHandle],
    ) -> Result<R::Loader, ContextError> {
        build_class_loader(self, runtime, compilation_sources)
    }

    /// Builds a context by walking a live class loader chain through the
    /// runtime. The result is immediately resolved and borrows its dex files.
    pub fn from_class_loader<R: ManagedRuntime>(
        runtime: &R,
        loader: &R::Loader,
    ) -> ClassLoaderContext {
        context_from_class_loader(runtime, loader)
    }

    /// Introspects a live loader chain and extracts the per dex file contexts
    /// in one call.
    pub fn encode_classpath_contexts_for_class_loader<R: ManagedRuntime>(
        runtime: &R,
        loader: &R::Loader,
    ) -> BTreeMap<String, String> {
        ClassLoaderContext::from_class_loader(runtime, loader).encode_classpath_contexts("")
    }
}
