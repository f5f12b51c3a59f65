use crate::dex::{DexHandle, InstructionSet};
use crate::tests::fakes::{FakeDexResolver, FakeRuntime};
use crate::types::{ClassLoaderContext, ResolutionState, VerificationResult};

#[test]
fn round_trip_with_checksums_and_shared_libraries() {
    let mut resolver = FakeDexResolver::new();
    resolver.add_dex("/data/app/a.dex", 111);
    resolver.add_dex("/data/app/s.dex", 222);

    let mut ctx = ClassLoaderContext::create("PCL[/data/app/a.dex]{DLC[/data/app/s.dex]}").unwrap();
    assert!(ctx.open_dex_files(&resolver, InstructionSet::Arm64, ""));
    assert_eq!(ctx.resolution(), ResolutionState::Resolved(true));

    let stored = ctx.encode_for_oat_file("");
    assert_eq!(stored, "PCL[/data/app/a.dex*111]{DLC[/data/app/s.dex*222]}");

    // A second load resolving the same way verifies against the stored form
    let mut fresh =
        ClassLoaderContext::create("PCL[/data/app/a.dex]{DLC[/data/app/s.dex]}").unwrap();
    assert!(fresh.open_dex_files(&resolver, InstructionSet::Arm64, ""));
    assert_eq!(fresh.verify_context_match(&stored), VerificationResult::Verifies);
}

#[test]
fn open_resolves_relative_locations() {
    let mut resolver = FakeDexResolver::new();
    resolver.add_dex("/data/app/a.dex", 111);

    let mut ctx = ClassLoaderContext::create("PCL[a.dex]").unwrap();
    assert!(ctx.open_dex_files(&resolver, InstructionSet::Arm64, "/data/app"));

    // The classpath now names the opened location
    assert_eq!(ctx.encode_for_oat_file(""), "PCL[/data/app/a.dex*111]");
    // and rebasing brings the relative form back
    assert_eq!(ctx.encode_for_oat_file("/data/app"), "PCL[a.dex*111]");
    // A descriptor stored with the relative location still verifies
    assert_eq!(
        ctx.verify_context_match("PCL[a.dex*111]"),
        VerificationResult::Verifies
    );
}

#[test]
fn multidex_containers_expand_on_open() {
    let mut resolver = FakeDexResolver::new();
    resolver.add_multidex("app.jar", &[1, 2, 3]);

    let mut ctx = ClassLoaderContext::create("PCL[app.jar]").unwrap();
    assert!(ctx.open_dex_files(&resolver, InstructionSet::Arm, ""));
    assert_eq!(ctx.loader(0).classpath.len(), 3);
    assert_eq!(
        ctx.encode_for_oat_file(""),
        "PCL[app.jar*1:app.jar!classes2.dex*2:app.jar!classes3.dex*3]"
    );
    // dex2oat still sees the container once
    assert_eq!(ctx.encode_for_dex2oat(""), "PCL[app.jar]");
}

#[test]
fn resolution_failure_keeps_context_unusable() {
    let resolver = FakeDexResolver::new();
    let mut ctx = ClassLoaderContext::create("PCL[missing.dex]").unwrap();
    assert!(!ctx.open_dex_files(&resolver, InstructionSet::Arm, ""));
    assert_eq!(ctx.resolution(), ResolutionState::Resolved(false));

    let mut runtime = FakeRuntime::new();
    assert!(ctx.create_class_loader(&mut runtime, &[]).is_err());
}

#[test]
fn open_attempts_every_entry() {
    let mut resolver = FakeDexResolver::new();
    resolver.add_dex("a.dex", 1);
    resolver.add_dex("c.dex", 3);

    let mut ctx = ClassLoaderContext::create("PCL[a.dex:b.dex:c.dex]").unwrap();
    assert!(!ctx.open_dex_files(&resolver, InstructionSet::Arm, ""));
    // The files around the bad entry were still opened
    assert_eq!(ctx.loader(0).opened_dex_files.len(), 2);
    // and the declared classpath keeps its shape
    assert_eq!(ctx.loader(0).classpath.len(), 3);
}

#[test]
fn open_twice_returns_the_first_outcome() {
    let resolver = FakeDexResolver::new();
    let mut ctx = ClassLoaderContext::create("PCL[missing.dex]").unwrap();
    assert!(!ctx.open_dex_files(&resolver, InstructionSet::Arm, ""));

    let mut late = FakeDexResolver::new();
    late.add_dex("missing.dex", 1);
    assert!(!ctx.open_dex_files(&late, InstructionSet::Arm, ""));
    assert_eq!(ctx.resolution(), ResolutionState::Resolved(false));
}

#[test]
fn in_memory_classpaths_do_not_reopen() {
    let resolver = FakeDexResolver::new();
    let mut ctx = ClassLoaderContext::parse("IMC[<unknown>*42]", true).unwrap();
    assert!(!ctx.open_dex_files(&resolver, InstructionSet::Arm, ""));

    // Even an empty in-memory loader cannot resolve from disk
    let mut empty = ClassLoaderContext::create("IMC[]").unwrap();
    assert!(!empty.open_dex_files(&resolver, InstructionSet::Arm, ""));
    assert_eq!(empty.resolution(), ResolutionState::Resolved(false));
}

#[test]
fn special_shared_library_flows() {
    let mut ctx = ClassLoaderContext::create("&").unwrap();
    assert!(ctx.is_special_shared_library());
    assert_eq!(ctx.chain_len(), 0);
    assert_eq!(ctx.encode_for_oat_file(""), "&");
    assert_eq!(ctx.encode_for_dex2oat(""), "&");
    assert!(ctx.encode_classpath_contexts("").is_empty());

    let resolver = FakeDexResolver::new();
    assert!(ctx.open_dex_files(&resolver, InstructionSet::Arm, ""));
}

#[test]
fn duplicates_found_after_resolution() {
    let mut resolver = FakeDexResolver::new();
    resolver.add_dex("a.dex", 1);
    resolver.add_dex("b.dex", 2);

    let mut ctx = ClassLoaderContext::create("PCL[a.dex];DLC[b.dex]").unwrap();
    assert!(ctx.open_dex_files(&resolver, InstructionSet::Arm, ""));

    let same = DexHandle::new("a.dex", 1);
    let stale = DexHandle::new("a.dex", 7);
    let duplicates = ctx.check_for_duplicate_dex_files(&[&same, &stale]);
    assert_eq!(duplicates, vec![&same]);
}
