/* Structural match of a stored context descriptor against the context       */
/* observed at load time, and duplicate detection for already loaded dex files. */

use crate::dex::DexHandle;
use crate::types::{
    ChainEntry, ClassLoaderContext, LoaderInfo, VerificationResult, SPECIAL_SHARED_LIBRARY,
};
use log::warn;
use std::collections::HashSet;

pub(crate) fn verify_context_match(
    context: &ClassLoaderContext,
    candidate_spec: &str,
) -> VerificationResult
{
    if candidate_spec == SPECIAL_SHARED_LIBRARY
    {
        return VerificationResult::ForcedToSkipChecks;
    }
    let expected = match ClassLoaderContext::parse(candidate_spec, true)
    {
        Some(expected) => expected,
        None =>
        {
            warn!("Invalid candidate class loader context: {}", candidate_spec);
            return VerificationResult::Mismatch;
        }
    };
    if context.is_special_shared_library()
    {
        return VerificationResult::ForcedToSkipChecks;
    }
    if expected.chain.len() != context.chain.len()
    {
        warn!(
            "Mismatch in the number of class loaders: expected={}, found={}",
            expected.chain.len(),
            context.chain.len()
        );
        return VerificationResult::Mismatch;
    }
    for (expected_entry, found_entry) in expected.chain.iter().zip(context.chain.iter())
    {
        let found = match found_entry
        {
            ChainEntry::Loader(found) => found,
            ChainEntry::Unsupported { .. } =>
            {
                warn!("Chain contains a class loader that cannot be verified");
                return VerificationResult::Mismatch;
            }
        };
        // The grammar cannot express an unsupported element, so expected is
        // always a Loader here
        if let ChainEntry::Loader(expected) = expected_entry
        {
            if !loader_matches(expected, found)
            {
                return VerificationResult::Mismatch;
            }
        }
    }
    VerificationResult::Verifies
}

fn loader_matches(expected: &LoaderInfo, found: &LoaderInfo) -> bool
{
    if expected.kind != found.kind
    {
        warn!(
            "Mismatch in class loader type: expected={}, found={}",
            expected.kind, found.kind
        );
        return false;
    }
    if expected.classpath.len() != found.classpath.len()
    {
        warn!(
            "Mismatch in classpath size for {}: expected={}, found={}",
            expected.kind,
            expected.classpath.len(),
            found.classpath.len()
        );
        return false;
    }
    for (expected_entry, found_entry) in expected.classpath.iter().zip(found.classpath.iter())
    {
        if !locations_match(&expected_entry.location, &found_entry.location)
        {
            warn!(
                "Mismatch in dex location: expected={}, found={}",
                expected_entry.location, found_entry.location
            );
            return false;
        }
        if expected_entry.checksum != found_entry.checksum
        {
            warn!(
                "Mismatch in dex checksum for {}: expected={:?}, found={:?}",
                expected_entry.location, expected_entry.checksum, found_entry.checksum
            );
            return false;
        }
    }
    if expected.shared_libraries.len() != found.shared_libraries.len()
    {
        warn!(
            "Mismatch in the number of shared libraries: expected={}, found={}",
            expected.shared_libraries.len(),
            found.shared_libraries.len()
        );
        return false;
    }
    for (expected_library, found_library) in expected
        .shared_libraries
        .iter()
        .zip(found.shared_libraries.iter())
    {
        if !loader_matches(expected_library, found_library)
        {
            return false;
        }
    }
    true
}

/// Locations match when equal, or when one is absolute, the other relative and
/// the absolute one ends with "/" followed by the relative one.
fn locations_match(expected: &str, found: &str) -> bool
{
    if expected == found
    {
        return true;
    }
    let (absolute, relative) = if expected.starts_with('/') && !found.starts_with('/')
    {
        (expected, found)
    }
    else if found.starts_with('/') && !expected.starts_with('/')
    {
        (found, expected)
    }
    else
    {
        return false;
    };
    absolute.len() > relative.len()
        && absolute.ends_with(relative)
        && absolute.as_bytes()[absolute.len() - relative.len() - 1] == b'/'
}

pub(crate) fn find_duplicate_dex_files<'a>(
    context: &ClassLoaderContext,
    dex_files: &[&'a DexHandle],
) -> Vec<&'a DexHandle>
{
    let mut loaded: HashSet<(String, u32)> = HashSet::new();
    for entry in &context.chain
    {
        if let ChainEntry::Loader(info) = entry
        {
            collect_dex_identities(info, &mut loaded);
        }
    }
    dex_files
        .iter()
        .filter(|dex_file| loaded.contains(&(dex_file.location().to_string(), dex_file.checksum())))
        .copied()
        .collect()
}

fn collect_dex_identities(info: &LoaderInfo, loaded: &mut HashSet<(String, u32)>)
{
    for dex_file in &info.opened_dex_files
    {
        loaded.insert((dex_file.location().to_string(), dex_file.checksum()));
    }
    for library in &info.shared_libraries
    {
        collect_dex_identities(library, loaded);
    }
}
