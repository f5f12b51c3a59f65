
#[cfg(test)]
mod context_roundtrip;

#[cfg(test)]
mod tests {
    use crate::types::{ClassLoaderContext, LoaderKind};

    #[test]
    fn empty_spec_is_a_single_path_loader() {
        let ctx = ClassLoaderContext::create("").unwrap();
        assert_eq!(ctx.chain_len(), 1);
        assert_eq!(ctx.loader(0).kind, LoaderKind::PathClassLoader);
        assert!(ctx.loader(0).classpath.is_empty());
        assert!(!ctx.is_special_shared_library());
        assert_eq!(ctx.encode_for_dex2oat(""), "PCL[]");
    }

    #[test]
    fn descriptor_round_trip() {
        let spec = "PCL[a.dex*1]{DLC[s.dex*2]};DLC[b.dex*3]";
        let ctx = ClassLoaderContext::parse(spec, true).unwrap();
        assert_eq!(ctx.encode_for_oat_file(""), spec);
    }

    #[test]
    fn special_values_are_valid_encodings() {
        assert!(ClassLoaderContext::is_valid_encoding("&"));
        assert!(ClassLoaderContext::is_valid_encoding(""));
        assert!(ClassLoaderContext::is_valid_encoding("=UnsupportedClassLoaderContext="));
    }
}
