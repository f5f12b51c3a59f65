/* Writers for the two persisted context encodings plus the per dex file  */
/* ("per split") context map used when compiling app splits individually. */

use crate::dex::base_location;
use crate::types::{
    ChainEntry, ClassLoaderContext, LoaderInfo, LoaderKind, IN_MEMORY_DEX_LOCATION,
    SPECIAL_SHARED_LIBRARY, UNSUPPORTED_CONTEXT_ENCODING,
};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EncodeForm
{
    /// Stored in the oat file: checksums and shared libraries included
    OatFile,
    /// Passed to dex2oat: no checksums, no shared libraries, multidex folded
    Dex2oat,
    /// Per split contexts: dex2oat style classpaths, shared libraries kept
    SplitContext,
}

pub(crate) fn encode_context(
    context: &ClassLoaderContext,
    form: EncodeForm,
    base_dir: &str,
) -> String
{
    if context.is_special_shared_library()
    {
        return SPECIAL_SHARED_LIBRARY.to_string();
    }
    if context.has_unsupported_element()
    {
        return UNSUPPORTED_CONTEXT_ENCODING.to_string();
    }
    let mut out = String::new();
    for (index, entry) in context.chain.iter().enumerate()
    {
        if index > 0
        {
            out.push(';');
        }
        if let ChainEntry::Loader(info) = entry
        {
            write_loader(&mut out, info, form, base_dir);
        }
    }
    out
}

pub(crate) fn write_loader(out: &mut String, info: &LoaderInfo, form: EncodeForm, base_dir: &str)
{
    out.push_str(info.kind.to_str());
    out.push('[');
    write_classpath(out, info, form, base_dir);
    out.push(']');
    if form != EncodeForm::Dex2oat && !info.shared_libraries.is_empty()
    {
        out.push('{');
        for (index, library) in info.shared_libraries.iter().enumerate()
        {
            if index > 0
            {
                out.push('#');
            }
            write_loader(out, library, form, base_dir);
        }
        out.push('}');
    }
}

fn write_classpath(out: &mut String, info: &LoaderInfo, form: EncodeForm, base_dir: &str)
{
    // In-memory dex files always serialize under the <unknown> location
    let in_memory = info.kind == LoaderKind::InMemoryDexClassLoader;
    let mut first = true;
    let mut seen_locations: HashSet<String> = HashSet::new();
    for entry in &info.classpath
    {
        match form
        {
            EncodeForm::OatFile =>
            {
                if !first
                {
                    out.push(':');
                }
                first = false;
                if in_memory
                {
                    out.push_str(IN_MEMORY_DEX_LOCATION);
                }
                else
                {
                    out.push_str(rebase_location(&entry.location, base_dir));
                }
                if let Some(checksum) = entry.checksum
                {
                    out.push('*');
                    out.push_str(&checksum.to_string());
                }
            }
            EncodeForm::Dex2oat | EncodeForm::SplitContext =>
            {
                let base = if in_memory
                {
                    IN_MEMORY_DEX_LOCATION
                }
                else
                {
                    base_location(&entry.location)
                };
                if !seen_locations.insert(base.to_string())
                {
                    continue;
                }
                if !first
                {
                    out.push(':');
                }
                first = false;
                out.push_str(rebase_location(base, base_dir));
            }
        }
    }
}

/// Strips `base_dir` from the front of a location when the location sits under
/// it, leaving the relative remainder.
fn rebase_location<'a>(location: &'a str, base_dir: &str) -> &'a str
{
    if !base_dir.is_empty()
        && location.len() > base_dir.len() + 1
        && location.starts_with(base_dir)
        && location.as_bytes()[base_dir.len()] == b'/'
    {
        &location[base_dir.len() + 1..]
    }
    else
    {
        location
    }
}

/// The oat file encoding of one loader subtree with no rebasing, used as the
/// structural identity of a shared library when building hierarchies.
pub(crate) fn loader_signature(info: &LoaderInfo) -> String
{
    let mut out = String::new();
    write_loader(&mut out, info, EncodeForm::OatFile, "");
    out
}

pub(crate) fn encode_classpath_contexts(
    context: &ClassLoaderContext,
    base_dir: &str,
) -> BTreeMap<String, String>
{
    let mut encodings = BTreeMap::new();
    if context.is_special_shared_library()
    {
        return encodings;
    }
    let poisoned = context.has_unsupported_element();

    for (node_index, entry) in context.chain.iter().enumerate()
    {
        match entry
        {
            ChainEntry::Loader(info) =>
            {
                for position in 0..info.classpath.len()
                {
                    let key = split_key(info, position);
                    if encodings.contains_key(&key)
                    {
                        continue;
                    }
                    let value = if poisoned
                    {
                        UNSUPPORTED_CONTEXT_ENCODING.to_string()
                    }
                    else
                    {
                        encode_split_context(context, node_index, position, base_dir)
                    };
                    encodings.insert(key, value);
                }
            }
            ChainEntry::Unsupported { dex_locations } =>
            {
                for location in dex_locations
                {
                    encodings
                        .entry(base_location(location).to_string())
                        .or_insert_with(|| UNSUPPORTED_CONTEXT_ENCODING.to_string());
                }
            }
        }
    }
    encodings
}

fn split_key(info: &LoaderInfo, position: usize) -> String
{
    if info.kind == LoaderKind::InMemoryDexClassLoader
    {
        IN_MEMORY_DEX_LOCATION.to_string()
    }
    else
    {
        base_location(&info.classpath[position].location).to_string()
    }
}

// The context one split compiles against: earlier entries of its own loader act
// as the whole classpath of a synthesized first element, ancestors follow.
fn encode_split_context(
    context: &ClassLoaderContext,
    node_index: usize,
    position: usize,
    base_dir: &str,
) -> String
{
    let info = match &context.chain[node_index]
    {
        ChainEntry::Loader(info) => info,
        ChainEntry::Unsupported { .. } => return UNSUPPORTED_CONTEXT_ENCODING.to_string(),
    };
    let mut head = LoaderInfo::new(info.kind);
    head.classpath = info.classpath[..position].to_vec();
    head.shared_libraries = info.shared_libraries.clone();

    let mut out = String::new();
    write_loader(&mut out, &head, EncodeForm::SplitContext, base_dir);
    for ancestor in &context.chain[node_index + 1..]
    {
        out.push(';');
        if let ChainEntry::Loader(ancestor_info) = ancestor
        {
            write_loader(&mut out, ancestor_info, EncodeForm::SplitContext, base_dir);
        }
    }
    out
}
