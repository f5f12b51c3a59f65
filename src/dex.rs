/* Dex file identities, the resolver trait used to open classpath entries, */
/* and the resolution pass that turns declared classpaths into opened files. */

use crate::types::{
    ChainEntry, ClassLoaderContext, ClasspathEntry, ContextError, LoaderInfo, LoaderKind,
    ResolutionState,
};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between a container location and the name of a secondary dex file
/// inside it, e.g. `base.apk!classes2.dex`.
pub const MULTIDEX_SEPARATOR: char = '!';

/// Identity of one opened dex file: where it lives and the checksum of its
/// contents. Secondary multidex files carry the `!` suffixed location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DexHandle {
    location: String,
    checksum: u32,
}

impl DexHandle {
    pub fn new(location: &str, checksum: u32) -> DexHandle {
        DexHandle {
            location: location.to_string(),
            checksum,
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}

impl fmt::Display for DexHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}*{}", self.location, self.checksum)
    }
}

/// The location of the container a dex file came from: everything before the
/// multidex separator.
///
/// # Examples
///
/// ```
///  use clcontext::dex::base_location;
///
///  assert_eq!(base_location("base.apk!classes2.dex"), "base.apk");
///  assert_eq!(base_location("base.apk"), "base.apk");
/// ```
pub fn base_location(location: &str) -> &str {
    match location.find(MULTIDEX_SEPARATOR) {
        Some(index) => &location[..index],
        None => location,
    }
}

/// Instruction sets dex files get compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstructionSet {
    Arm,
    Arm64,
    X86,
    X86_64,
    Riscv64,
}

impl InstructionSet {
    pub fn to_str(&self) -> &str {
        match self {
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
            Self::X86 => "x86",
            Self::X86_64 => "x86_64",
            Self::Riscv64 => "riscv64",
        }
    }
}

impl FromStr for InstructionSet {
    type Err = ContextError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "arm" => Self::Arm,
            "arm64" => Self::Arm64,
            "x86" => Self::X86,
            "x86_64" => Self::X86_64,
            "riscv64" => Self::Riscv64,
            _ => {
                return Err(ContextError {
                    details: format!("Unknown instruction set: {s}"),
                });
            }
        })
    }
}

impl fmt::Display for InstructionSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

/// Opens the dex files at a location for a given instruction set. One location
/// can yield several files when the container holds secondary multidex files.
pub trait DexResolver {
    fn open(&self, location: &str, isa: InstructionSet) -> Result<Vec<DexHandle>, ContextError>;
}

/// Resolves a classpath entry against the directory the classpath is relative
/// to. Absolute locations are kept as they are.
pub fn resolve_classpath_location(location: &str, classpath_dir: &str) -> String {
    if classpath_dir.is_empty() || location.starts_with('/') {
        return location.to_string();
    }
    if classpath_dir.ends_with('/') {
        format!("{}{}", classpath_dir, location)
    } else {
        format!("{}/{}", classpath_dir, location)
    }
}

pub(crate) fn open_context_dex_files(
    context: &mut ClassLoaderContext,
    resolver: &dyn DexResolver,
    isa: InstructionSet,
    classpath_dir: &str,
) -> bool {
    if let ResolutionState::Resolved(success) = context.resolution {
        warn!("Dex files were already opened for this context");
        return success;
    }
    let mut success = true;
    for entry in &mut context.chain {
        if let ChainEntry::Loader(info) = entry {
            if !open_loader_dex_files(info, resolver, isa, classpath_dir) {
                success = false;
            }
        }
    }
    context.resolution = ResolutionState::Resolved(success);
    success
}

fn open_loader_dex_files(
    info: &mut LoaderInfo,
    resolver: &dyn DexResolver,
    isa: InstructionSet,
    classpath_dir: &str,
) -> bool {
    let mut success = true;
    if info.kind == LoaderKind::InMemoryDexClassLoader {
        // In-memory dex files have no location to reopen
        warn!("Cannot open dex files for an in-memory class loader");
        success = false;
    } else {
        let mut opened: Vec<DexHandle> = vec![];
        // Every entry is attempted so one bad file does not hide the others
        for entry in &info.classpath {
            let location = resolve_classpath_location(&entry.location, classpath_dir);
            match resolver.open(&location, isa) {
                Ok(handles) => opened.extend(handles),
                Err(error) => {
                    warn!("Could not open dex files for {}: {}", location, error);
                    success = false;
                }
            }
        }
        if success {
            // The opened files are the truth from here on: multidex containers
            // expand into one entry per member
            info.classpath = opened
                .iter()
                .map(|handle| ClasspathEntry::with_checksum(handle.location(), handle.checksum()))
                .collect();
        }
        info.opened_dex_files = opened;
    }
    for library in &mut info.shared_libraries {
        if !open_loader_dex_files(library, resolver, isa, classpath_dir) {
            success = false;
        }
    }
    success
}

#[cfg(test)]
mod tests {
    use crate::dex::{base_location, resolve_classpath_location, InstructionSet};
    use std::str::FromStr;

    #[test]
    fn base_location_splits_multidex_names() {
        assert_eq!(base_location("base.apk"), "base.apk");
        assert_eq!(base_location("base.apk!classes2.dex"), "base.apk");
        assert_eq!(base_location("/data/app/base.apk!classes3.dex"), "/data/app/base.apk");
    }

    #[test]
    fn classpath_locations_resolve_against_the_classpath_dir() {
        assert_eq!(resolve_classpath_location("a.dex", "/data/app"), "/data/app/a.dex");
        assert_eq!(resolve_classpath_location("a.dex", "/data/app/"), "/data/app/a.dex");
        assert_eq!(resolve_classpath_location("/system/a.dex", "/data/app"), "/system/a.dex");
        assert_eq!(resolve_classpath_location("a.dex", ""), "a.dex");
    }

    #[test]
    fn instruction_set_names() {
        for name in ["arm", "arm64", "x86", "x86_64", "riscv64"] {
            let isa = InstructionSet::from_str(name).unwrap();
            assert_eq!(isa.to_str(), name);
        }
        assert!(InstructionSet::from_str("mips").is_err());
    }
}
