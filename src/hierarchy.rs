/* Building a live class loader hierarchy out of a resolved context, and the */
/* reverse: describing an existing hierarchy as a context. */

use crate::context_write::loader_signature;
use crate::dex::DexHandle;
use crate::types::{
    ChainEntry, ClassLoaderContext, ClasspathEntry, ContextError, LoaderInfo, LoaderKind,
    ResolutionState, IN_MEMORY_DEX_LOCATION,
};
use log::debug;
use std::collections::HashMap;

/// What a runtime reports about one of its class loaders. `kind` is None for
/// loader types the descriptor grammar cannot express; `parent` is None when
/// the parent is the boot class loader.
pub struct IntrospectedLoader<L> {
    pub kind: Option<LoaderKind>,
    pub classpath: Vec<DexHandle>,
    pub parent: Option<L>,
    pub shared_libraries: Vec<L>,
}

/// The runtime that owns real class loaders. Creating walks a context top
/// down; introspection lets a context be read back out of a live hierarchy.
pub trait ManagedRuntime {
    type Loader: Clone;

    fn create_loader(
        &mut self,
        kind: LoaderKind,
        dex_files: &[DexHandle],
        parent: Option<&Self::Loader>,
        shared_libraries: &[Self::Loader],
    ) -> Result<Self::Loader, ContextError>;

    fn introspect(&self, loader: &Self::Loader) -> IntrospectedLoader<Self::Loader>;
}

pub(crate) fn build_class_loader<R: ManagedRuntime>(
    context: &ClassLoaderContext,
    runtime: &mut R,
    compilation_sources: &[DexHandle],
) -> Result<R::Loader, ContextError> {
    if context.resolution != ResolutionState::Resolved(true) {
        return Err(ContextError::new(
            "Dex files must be opened before creating a class loader",
        ));
    }
    if context.chain.is_empty() {
        // Special shared library contexts carry no chain of their own
        return runtime.create_loader(LoaderKind::PathClassLoader, compilation_sources, None, &[]);
    }
    let mut cache: HashMap<String, R::Loader> = HashMap::new();
    let mut parent: Option<R::Loader> = None;
    for index in (0..context.chain.len()).rev() {
        let info = match &context.chain[index] {
            ChainEntry::Loader(info) => info,
            ChainEntry::Unsupported { .. } => {
                return Err(ContextError::new(
                    "Cannot create a class loader for an unsupported chain element",
                ));
            }
        };
        let libraries = build_shared_libraries(info, runtime, &mut cache)?;
        if info.opened_dex_files.len() != info.classpath.len() {
            return Err(ContextError::new(
                "Loader classpath does not match its opened dex files",
            ));
        }
        let mut dex_files = info.opened_dex_files.clone();
        if index == 0 {
            dex_files.extend(compilation_sources.iter().cloned());
        }
        debug!(
            "Creating {} with {} dex files and {} shared libraries",
            info.kind,
            dex_files.len(),
            libraries.len()
        );
        parent = Some(runtime.create_loader(info.kind, &dex_files, parent.as_ref(), &libraries)?);
    }
    match parent {
        Some(loader) => Ok(loader),
        None => Err(ContextError::new("Class loader chain is empty")),
    }
}

// Shared libraries hang off the boot class loader. Identical subtrees reuse
// one loader, keyed by their full encoding.
fn build_shared_libraries<R: ManagedRuntime>(
    info: &LoaderInfo,
    runtime: &mut R,
    cache: &mut HashMap<String, R::Loader>,
) -> Result<Vec<R::Loader>, ContextError> {
    let mut libraries = Vec::with_capacity(info.shared_libraries.len());
    for library in &info.shared_libraries {
        let signature = loader_signature(library);
        if let Some(existing) = cache.get(&signature) {
            libraries.push(existing.clone());
            continue;
        }
        let nested = build_shared_libraries(library, runtime, cache)?;
        if library.opened_dex_files.len() != library.classpath.len() {
            return Err(ContextError::new(
                "Loader classpath does not match its opened dex files",
            ));
        }
        let loader =
            runtime.create_loader(library.kind, &library.opened_dex_files, None, &nested)?;
        cache.insert(signature, loader.clone());
        libraries.push(loader);
    }
    Ok(libraries)
}

pub(crate) fn context_from_class_loader<R: ManagedRuntime>(
    runtime: &R,
    loader: &R::Loader,
) -> ClassLoaderContext {
    let mut chain = vec![];
    let mut current = Some(loader.clone());
    while let Some(loader) = current {
        let introspected = runtime.introspect(&loader);
        chain.push(chain_entry_from_loader(runtime, &introspected));
        current = introspected.parent;
    }
    let mut context = ClassLoaderContext::from_chain(chain);
    context.resolution = ResolutionState::Resolved(true);
    context.owns_dex_files = false;
    context
}

fn chain_entry_from_loader<R: ManagedRuntime>(
    runtime: &R,
    introspected: &IntrospectedLoader<R::Loader>,
) -> ChainEntry {
    let kind = match introspected.kind {
        Some(kind) => kind,
        None => {
            return ChainEntry::Unsupported {
                dex_locations: introspected
                    .classpath
                    .iter()
                    .map(|handle| handle.location().to_string())
                    .collect(),
            };
        }
    };
    let mut info = LoaderInfo::new(kind);
    for handle in &introspected.classpath {
        let entry = if kind == LoaderKind::InMemoryDexClassLoader {
            // In-memory dex files are only identified by checksum
            ClasspathEntry {
                location: IN_MEMORY_DEX_LOCATION.to_string(),
                checksum: Some(handle.checksum()),
            }
        } else {
            ClasspathEntry::with_checksum(handle.location(), handle.checksum())
        };
        info.classpath.push(entry);
    }
    info.opened_dex_files = introspected.classpath.clone();
    for library in &introspected.shared_libraries {
        match shared_library_from_loader(runtime, library) {
            Some(library_info) => info.shared_libraries.push(library_info),
            None => {
                // A loader this grammar cannot express anywhere below makes
                // the whole element undescribable
                return ChainEntry::Unsupported {
                    dex_locations: info
                        .classpath
                        .iter()
                        .map(|entry| entry.location.clone())
                        .collect(),
                };
            }
        }
    }
    ChainEntry::Loader(info)
}

// Parents of shared libraries are not walked, matching how the libraries get
// created in the first place.
fn shared_library_from_loader<R: ManagedRuntime>(
    runtime: &R,
    loader: &R::Loader,
) -> Option<LoaderInfo> {
    let introspected = runtime.introspect(loader);
    match chain_entry_from_loader(runtime, &introspected) {
        ChainEntry::Loader(info) => Some(info),
        ChainEntry::Unsupported { .. } => None,
    }
}
