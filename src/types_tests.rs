//! Marshalling properties that must hold for every spelling family the
//! resolver accepts.

#[cfg(test)]
mod tests {
    use crate::metabase::Metabase;
    use crate::session::CompileSession;
    use crate::types::{Marshal, NativeKind, ScriptKind, TypeResolver};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const BASES: [&str; 7] = [
        "int",
        "float",
        "double",
        "long",
        "long long",
        "long double",
        "short",
    ];
    const QUALIFIERS: [&str; 6] = [
        "",
        "signed",
        "unsigned",
        "const",
        "const signed",
        "const unsigned",
    ];
    const STARS: [&str; 3] = ["", "*", "**"];

    fn resolver() -> TypeResolver {
        TypeResolver::new(Arc::new(Metabase::default()))
    }

    fn spelling(qualifier: &str, base: &str, stars: &str) -> String {
        let mut s = [qualifier, base]
            .iter()
            .filter(|p| !p.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        if !stars.is_empty() {
            s.push(' ');
            s.push_str(stars);
        }
        s
    }

    #[test]
    fn test_primitive_matrix() {
        let mut r = resolver();
        let mut checked = 0;
        for base in BASES {
            for qualifier in QUALIFIERS {
                for stars in STARS {
                    let raw = spelling(qualifier, base, stars);
                    let t = r
                        .resolve(&raw)
                        .unwrap_or_else(|e| panic!("'{}' failed: {}", raw, e));

                    assert!(matches!(t.native, NativeKind::Primitive), "{}", raw);
                    assert_eq!(t.script_kind(), ScriptKind::Number, "{}", raw);
                    assert_eq!(t.is_const, qualifier.starts_with("const"), "{}", raw);
                    assert_eq!(t.is_pointer(), !stars.is_empty(), "{}", raw);
                    assert_eq!(t.is_pointer_to_pointer(), stars == "**", "{}", raw);

                    let cast = raw.strip_prefix("const ").unwrap_or(&raw).to_string();
                    assert_eq!(t.to_cast(), cast, "{}", raw);

                    let mut m = Marshal::default();
                    let expected = if stars.is_empty() {
                        format!("static_cast<{}>(JSValueToNumber(ctx,v,exception))", cast)
                    } else {
                        format!(
                            "static_cast<{}>(HyperloopJSValueToVoidPointer(ctx,v,exception))",
                            cast
                        )
                    };
                    assert_eq!(t.to_native_value("v", &mut m), expected);
                    assert!(m.preamble.is_empty() && m.cleanup.is_empty(), "{}", raw);
                    checked += 1;
                }
            }
        }
        assert_eq!(checked, 7 * 6 * 3);
    }

    #[test]
    fn test_char_pointers_allocate_one_buffer() {
        let mut r = resolver();
        for raw in ["char *", "const char *"] {
            let t = r.resolve(raw).unwrap();
            assert_eq!(t.script_kind(), ScriptKind::String, "{}", raw);
            assert!(matches!(t.native, NativeKind::String), "{}", raw);

            let mut m = Marshal::default();
            let native = t.to_native_value("arguments[0]", &mut m);
            let back = t.to_script_value(&native, &mut m);
            assert_eq!(native, "arguments_0_buf");
            assert_eq!(back, "HyperloopMakeString(ctx,arguments_0_buf,exception)");

            let allocs = m
                .preamble
                .iter()
                .filter(|l| l.contains("HyperloopJSValueToStringCopy"))
                .count();
            let frees = m.cleanup.iter().filter(|l| l.starts_with("delete []")).count();
            assert_eq!((allocs, frees), (1, 1), "{}", raw);
        }
        assert!(r.resolve("const char *").unwrap().is_const);
        assert!(!r.resolve("char *").unwrap().is_const);
    }

    #[test]
    fn test_structs_normalize_to_pointer() {
        let mut r = resolver();
        let by_value = r.resolve("struct Foo").unwrap();
        let by_pointer = r.resolve("struct Foo *").unwrap();
        assert_eq!(by_value.to_string(), "struct Foo *");
        assert_eq!(by_pointer.to_string(), "struct Foo *");
        assert!(by_value.was_not_pointer);
        assert!(!by_pointer.was_not_pointer);
        assert_eq!(by_value.class_key(), by_pointer.class_key());
    }

    #[test]
    fn test_session_obfuscation_is_stable_and_injective() {
        let mut session = CompileSession::new("arm64", Arc::new(Metabase::default()), true);
        let a = session.bridge_key("UIView_constructor");
        let b = session.bridge_key("UIView_constructor");
        let c = session.bridge_key("UILabel_constructor");
        assert_eq!(a, b);
        assert_ne!(a, c);

        // a fresh session replays the same sequence
        let mut again = CompileSession::new("arm64", Arc::new(Metabase::default()), true);
        assert_eq!(again.bridge_key("UIView_constructor"), a);
    }

    #[test]
    fn test_resolution_cache_is_per_session() {
        let metabase = Arc::new(
            Metabase::from_json(r#"{"types": {"CGFloat": {"type": "double"}}}"#).unwrap(),
        );
        let mut first = CompileSession::new("arm64", Arc::clone(&metabase), false);
        let mut second = CompileSession::new("x86_64", metabase, false);
        let a = first.types.resolve("CGFloat").unwrap();
        let b = second.types.resolve("CGFloat").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.to_cast(), b.to_cast());
    }
}
